//! Guide resolver
//!
//! Read-only bridge between operator channels and whatever identifiers
//! the EPG feeds actually advertise. For a channel and time window the
//! resolver tries, in order: the channel's configured EPG id, the mapping
//! table match on the channel's name, the channel number, and finally a
//! fuzzy display-name match. First non-empty result wins.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::database::EpgRepository;
use crate::errors::AppError;
use crate::models::{Channel, EpgProgram};

#[derive(Clone)]
pub struct EpgService {
    repo: EpgRepository,
}

impl EpgService {
    pub fn new(repo: EpgRepository) -> Self {
        Self { repo }
    }

    pub async fn programs_for_channel(
        &self,
        channel: &Channel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EpgProgram>, AppError> {
        // 1. configured EPG association
        if let Some(epg_id) = channel.epg_id.as_deref() {
            let programs = self.repo.programs_in_window(epg_id, start, end).await?;
            if !programs.is_empty() {
                return Ok(programs);
            }
        }

        // 2. mapping table: a feed channel whose name matches ours exactly
        if let Some(mapped) = self
            .repo
            .find_channel_by_display_name(&channel.name)
            .await?
        {
            let programs = self
                .repo
                .programs_in_window(&mapped.epg_id, start, end)
                .await?;
            if !programs.is_empty() {
                debug!(
                    channel = %channel.name,
                    epg_id = %mapped.epg_id,
                    "guide resolved via display-name mapping"
                );
                return Ok(programs);
            }
        }

        // 3. some feeds key programs by plain channel number
        let programs = self
            .repo
            .programs_in_window(&channel.number.to_string(), start, end)
            .await?;
        if !programs.is_empty() {
            return Ok(programs);
        }

        // 4. fuzzy: first word of the display name
        if let Some(first_word) = channel.name.split_whitespace().next() {
            if first_word.len() >= 3 && first_word != channel.name {
                if let Some(fuzzy) = self.repo.find_channel_by_display_name(first_word).await? {
                    let programs = self
                        .repo
                        .programs_in_window(&fuzzy.epg_id, start, end)
                        .await?;
                    if !programs.is_empty() {
                        debug!(
                            channel = %channel.name,
                            epg_id = %fuzzy.epg_id,
                            "guide resolved via fuzzy name match"
                        );
                        return Ok(programs);
                    }
                }
            }
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_database;
    use crate::models::EpgChannel;

    fn channel(name: &str, number: i64, epg_id: Option<&str>) -> Channel {
        Channel {
            id: "ch".to_string(),
            name: name.to_string(),
            number,
            enabled: true,
            logo_url: None,
            epg_id: epg_id.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn program(id: &str, epg_channel: &str) -> EpgProgram {
        EpgProgram {
            id: id.to_string(),
            channel_id: epg_channel.to_string(),
            title: id.to_string(),
            description: None,
            category: None,
            start_time: Utc::now() - chrono::Duration::minutes(10),
            end_time: Utc::now() + chrono::Duration::minutes(50),
        }
    }

    async fn setup() -> (EpgService, EpgRepository, tempfile::TempDir) {
        let (db, dir) = test_database().await;
        let repo = EpgRepository::new(db.pool().clone());
        (EpgService::new(repo.clone()), repo, dir)
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (Utc::now(), Utc::now() + chrono::Duration::hours(1))
    }

    #[tokio::test]
    async fn configured_epg_id_wins() {
        let (service, repo, _dir) = setup().await;
        repo.insert_program_for_test(&program("direct", "feed.one"))
            .await
            .unwrap();
        repo.insert_program_for_test(&program("by-number", "100"))
            .await
            .unwrap();

        let (start, end) = window();
        let found = service
            .programs_for_channel(&channel("One", 100, Some("feed.one")), start, end)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "direct");
    }

    #[tokio::test]
    async fn falls_back_to_channel_number() {
        let (service, repo, _dir) = setup().await;
        repo.insert_program_for_test(&program("by-number", "42"))
            .await
            .unwrap();

        let (start, end) = window();
        let found = service
            .programs_for_channel(&channel("Obscure", 42, None), start, end)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "by-number");
    }

    #[tokio::test]
    async fn falls_back_to_name_mapping() {
        let (service, repo, _dir) = setup().await;
        repo.insert_channel_for_test(&EpgChannel {
            id: "m1".to_string(),
            source_id: "src".to_string(),
            epg_id: "feed.sports".to_string(),
            display_name: "Sports Network".to_string(),
            icon_url: None,
        })
        .await
        .unwrap();
        repo.insert_program_for_test(&program("mapped", "feed.sports"))
            .await
            .unwrap();

        let (start, end) = window();
        let found = service
            .programs_for_channel(&channel("Sports Network", 7, None), start, end)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "mapped");
    }

    #[tokio::test]
    async fn empty_when_nothing_matches() {
        let (service, _repo, _dir) = setup().await;
        let (start, end) = window();
        let found = service
            .programs_for_channel(&channel("Ghost", 999, None), start, end)
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
