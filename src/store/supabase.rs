//! Supabase (PostgREST) backed daily totals.
//!
//! Expects the `daily_totals` table and `add_daily_totals` function from
//! `migrations/001_daily_totals.sql`. A submission is applied inside Postgres
//! as a single `INSERT .. ON CONFLICT DO UPDATE`, so concurrent submissions
//! for the same key cannot lose updates and a failed one changes nothing.

use super::{DailyKey, DailyStore, Increment};
use crate::error::StoreError;
use crate::schema::DailyEntry;
use anyhow::anyhow;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

const TABLE: &str = "daily_totals";

/// Supabase client configuration.
#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    service_role_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DailyTotalRow {
    nutrient: String,
    date: NaiveDate,
    value: f64,
    unit: String,
}

impl From<DailyTotalRow> for DailyEntry {
    fn from(row: DailyTotalRow) -> Self {
        DailyEntry {
            nutrient: row.nutrient,
            date: row.date,
            value: row.value,
            unit: row.unit,
        }
    }
}

impl SupabaseStore {
    /// Create a new Supabase store from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url =
            std::env::var("SUPABASE_URL").map_err(|_| anyhow!("SUPABASE_URL not set"))?;
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| anyhow!("SUPABASE_SERVICE_ROLE_KEY not set"))?;

        info!("Supabase daily store at {}", base_url);
        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key,
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, TABLE)
    }

    /// Helper: GET rows from the table with PostgREST filters.
    async fn get_rows(&self, query: &[(&str, String)]) -> Result<Vec<DailyTotalRow>, StoreError> {
        let resp = self
            .authed(self.client.get(self.table_url()))
            .query(query)
            .send()
            .await
            .map_err(|e| anyhow!("Supabase GET {} failed: {}", TABLE, e))?;

        let resp = check(resp, "GET daily_totals").await?;
        Ok(resp
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse daily_totals rows: {}", e))?)
    }
}

/// Map a non-success response to a store error; 409 is a write conflict.
async fn check(resp: Response, what: &str) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    if status == StatusCode::CONFLICT {
        return Err(StoreError::Conflict(format!("{}: {}", what, text)));
    }
    Err(StoreError::Backend(anyhow!("Supabase {} failed: {} - {}", what, status, text)))
}

/// The RPC returns rows in no particular order.
fn in_input_order(increments: &[Increment], rows: Vec<DailyTotalRow>) -> Result<Vec<DailyEntry>, StoreError> {
    increments
        .iter()
        .map(|inc| {
            rows.iter()
                .find(|row| row.nutrient == inc.key.nutrient && row.date == inc.key.date)
                .map(|row| DailyEntry {
                    nutrient: row.nutrient.clone(),
                    date: row.date,
                    value: row.value,
                    unit: row.unit.clone(),
                })
                .ok_or_else(|| StoreError::Backend(anyhow!("add_daily_totals returned no row for {}", inc.key)))
        })
        .collect()
}

fn key_filter(key: &DailyKey) -> Vec<(&'static str, String)> {
    vec![
        ("user_id", format!("eq.{}", key.user_id)),
        ("nutrient", format!("eq.{}", key.nutrient)),
        ("date", format!("eq.{}", key.date)),
    ]
}

#[async_trait::async_trait]
impl DailyStore for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn get(&self, key: &DailyKey) -> Result<Option<DailyEntry>, StoreError> {
        let mut query = key_filter(key);
        query.push(("select", "nutrient,date,value,unit".to_string()));
        let rows = self.get_rows(&query).await?;
        Ok(rows.into_iter().next().map(DailyEntry::from))
    }

    async fn upsert(&self, key: &DailyKey, value: f64, unit: &str) -> Result<(), StoreError> {
        let body = json!({
            "user_id": key.user_id,
            "nutrient": key.nutrient,
            "date": key.date,
            "value": value,
            "unit": unit,
        });

        let resp = self
            .authed(self.client.post(self.table_url()))
            .query(&[("on_conflict", "user_id,nutrient,date")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("Supabase upsert failed: {}", e))?;

        check(resp, "upsert daily_totals").await?;
        debug!("Upserted {} = {} {}", key, value, unit);
        Ok(())
    }

    async fn add_many(&self, increments: &[Increment]) -> Result<Vec<DailyEntry>, StoreError> {
        if increments.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/rest/v1/rpc/add_daily_totals", self.base_url);
        let items: Vec<serde_json::Value> = increments
            .iter()
            .map(|inc| {
                json!({
                    "user_id": inc.key.user_id,
                    "nutrient": inc.key.nutrient,
                    "date": inc.key.date,
                    "value": inc.value,
                    "unit": inc.unit,
                })
            })
            .collect();

        let resp = self
            .authed(self.client.post(&url))
            .json(&json!({ "p_items": items }))
            .send()
            .await
            .map_err(|e| anyhow!("Supabase add_daily_totals failed: {}", e))?;

        let resp = check(resp, "rpc add_daily_totals").await?;
        let rows: Vec<DailyTotalRow> = resp
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse add_daily_totals result: {}", e))?;

        let updated = in_input_order(increments, rows)?;
        debug!("Added {} daily totals in one statement", updated.len());
        Ok(updated)
    }

    async fn list(&self, user_id: &str, date: NaiveDate) -> Result<Vec<DailyEntry>, StoreError> {
        let rows = self
            .get_rows(&[
                ("user_id", format!("eq.{}", user_id)),
                ("date", format!("eq.{}", date)),
                ("select", "nutrient,date,value,unit".to_string()),
                ("order", "nutrient.asc".to_string()),
            ])
            .await?;
        Ok(rows.into_iter().map(DailyEntry::from).collect())
    }

    async fn history(&self, user_id: &str) -> Result<Vec<DailyEntry>, StoreError> {
        let rows = self
            .get_rows(&[
                ("user_id", format!("eq.{}", user_id)),
                ("select", "nutrient,date,value,unit".to_string()),
                ("order", "date.asc,nutrient.asc".to_string()),
            ])
            .await?;
        Ok(rows.into_iter().map(DailyEntry::from).collect())
    }

    async fn erase_user(&self, user_id: &str) -> Result<usize, StoreError> {
        let resp = self
            .authed(self.client.delete(self.table_url()))
            .query(&[("user_id", format!("eq.{}", user_id))])
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(|e| anyhow!("Supabase delete failed: {}", e))?;

        let resp = check(resp, "delete daily_totals").await?;
        let deleted: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse delete result: {}", e))?;
        info!("Erased {} daily totals for user {}", deleted.len(), user_id);
        Ok(deleted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(nutrient: &str, value: f64) -> DailyTotalRow {
        DailyTotalRow {
            nutrient: nutrient.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 10, 17).unwrap(),
            value,
            unit: "g".to_string(),
        }
    }

    #[test]
    fn test_rows_returned_in_input_order() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let increments = vec![
            Increment::new(DailyKey::new("u1", "sugar", date), 1.0, "g"),
            Increment::new(DailyKey::new("u1", "fat", date), 2.0, "g"),
        ];
        let entries = in_input_order(&increments, vec![row("fat", 5.0), row("sugar", 3.0)]).unwrap();
        assert_eq!(entries[0].nutrient, "sugar");
        assert_eq!(entries[1].value, 5.0);

        assert!(in_input_order(&increments, vec![row("fat", 5.0)]).is_err());
    }

    #[test]
    fn test_key_filter_uses_postgrest_eq() {
        let key = DailyKey::new("u1", "sodium", NaiveDate::from_ymd_opt(2026, 10, 17).unwrap());
        let filter = key_filter(&key);
        assert!(filter.contains(&("date", "eq.2026-10-17".to_string())));
        assert!(filter.contains(&("nutrient", "eq.sodium".to_string())));
    }
}
