//! Test variant analysis aggregates.

use crate::error::{DbError, Result};
use crate::types::AnalyzedTestVariant;
use crate::WeetbixDb;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::debug;
use weetbix_protocol::TestVariantStatus;

impl WeetbixDb {
    /// Merge observations into the analysis table in a single commit.
    ///
    /// `first_seen` only moves earlier and `last_seen` only moves later.
    /// Status and last invocation follow the latest observation, so pages
    /// arriving out of order still converge.
    pub async fn upsert_analyzed_test_variants(&self, variants: &[AnalyzedTestVariant]) -> Result<()> {
        if variants.is_empty() {
            return Ok(());
        }
        self.check_commit_size("analyzed_test_variants", variants.len())?;

        let mut tx = self.pool.begin().await?;
        for atv in variants {
            sqlx::query(
                r#"
                INSERT INTO analyzed_test_variants (
                    realm, test_id, variant_hash, variant, status, first_seen, last_seen, last_invocation_id
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(realm, test_id, variant_hash) DO UPDATE SET
                    variant = excluded.variant,
                    status = CASE WHEN excluded.last_seen >= last_seen
                        THEN excluded.status ELSE status END,
                    last_invocation_id = CASE WHEN excluded.last_seen >= last_seen
                        THEN excluded.last_invocation_id ELSE last_invocation_id END,
                    first_seen = MIN(first_seen, excluded.first_seen),
                    last_seen = MAX(last_seen, excluded.last_seen)
                "#,
            )
            .bind(&atv.realm)
            .bind(&atv.test_id)
            .bind(&atv.variant_hash)
            .bind(serde_json::to_string(&atv.variant)?)
            .bind(atv.status.as_str())
            .bind(atv.first_seen.timestamp_micros())
            .bind(atv.last_seen.timestamp_micros())
            .bind(&atv.last_invocation_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(rows = variants.len(), "Updated analyzed test variants");
        Ok(())
    }

    /// Analyzed variants of a realm, ordered by key.
    pub async fn read_analyzed_test_variants(&self, realm: &str) -> Result<Vec<AnalyzedTestVariant>> {
        let rows = sqlx::query(
            r#"
            SELECT realm, test_id, variant_hash, variant, status, first_seen, last_seen, last_invocation_id
            FROM analyzed_test_variants
            WHERE realm = ?
            ORDER BY test_id, variant_hash
            "#,
        )
        .bind(realm)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let status = TestVariantStatus::parse(&status).ok_or_else(|| {
                    DbError::invalid_state(format!("unknown variant status: {}", status))
                })?;
                let variant: BTreeMap<String, String> =
                    serde_json::from_str(&row.try_get::<String, _>("variant")?)?;
                Ok(AnalyzedTestVariant {
                    realm: row.try_get("realm")?,
                    test_id: row.try_get("test_id")?,
                    variant_hash: row.try_get("variant_hash")?,
                    variant,
                    status,
                    first_seen: Self::micros_to_datetime(row.try_get("first_seen")?)?,
                    last_seen: Self::micros_to_datetime(row.try_get("last_seen")?)?,
                    last_invocation_id: row.try_get("last_invocation_id")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn observation(
        status: TestVariantStatus,
        seen: DateTime<Utc>,
        invocation: &str,
    ) -> AnalyzedTestVariant {
        AnalyzedTestVariant {
            realm: "chromium:ci".to_string(),
            test_id: "ninja://tests:a".to_string(),
            variant_hash: "hash".to_string(),
            variant: BTreeMap::new(),
            status,
            first_seen: seen,
            last_seen: seen,
            last_invocation_id: invocation.to_string(),
        }
    }

    #[tokio::test]
    async fn test_merge_keeps_bounds_and_latest_status() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let day1 = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 10, 2, 0, 0, 0).unwrap();
        let day3 = Utc.with_ymd_and_hms(2026, 10, 3, 0, 0, 0).unwrap();

        db.upsert_analyzed_test_variants(&[observation(TestVariantStatus::Flaky, day2, "inv-2")])
            .await
            .unwrap();
        db.upsert_analyzed_test_variants(&[observation(
            TestVariantStatus::Unexpected,
            day3,
            "inv-3",
        )])
        .await
        .unwrap();
        // Older observation arrives late.
        db.upsert_analyzed_test_variants(&[observation(
            TestVariantStatus::Exonerated,
            day1,
            "inv-1",
        )])
        .await
        .unwrap();

        let stored = db.read_analyzed_test_variants("chromium:ci").await.unwrap();
        assert_eq!(stored.len(), 1);
        let atv = &stored[0];
        assert_eq!(atv.first_seen, day1);
        assert_eq!(atv.last_seen, day3);
        assert_eq!(atv.status, TestVariantStatus::Unexpected);
        assert_eq!(atv.last_invocation_id, "inv-3");
    }
}
