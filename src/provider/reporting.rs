use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::Arc;

use super::everflow::{ProviderError, ProviderReporting};
use crate::cache::{OpportunisticCache, DASHBOARD_TTL_SECS, PROVIDER_REPORT_TTL_SECS};

/// Provider reporting behind the opportunistic cache. Exports are never cached.
#[derive(Clone)]
pub struct ReportingService {
    reporting: Arc<dyn ProviderReporting>,
    cache: OpportunisticCache,
}

/// Entity report for one UTC day, grouped by offer and affiliate.
pub fn daily_entity_query(date: NaiveDate) -> Value {
    let day = date.format("%Y-%m-%d").to_string();
    json!({
        "from": day,
        "to": day,
        "timezone_id": 67,
        "currency_id": "USD",
        "columns": [{ "column": "offer" }, { "column": "affiliate" }],
        "query": { "filters": [] },
    })
}

impl ReportingService {
    pub fn new(reporting: Arc<dyn ProviderReporting>, cache: OpportunisticCache) -> Self {
        Self { reporting, cache }
    }

    pub async fn entity_report(&self, query: &Value) -> Result<Value, ProviderError> {
        let key = self.cache.hashed_key("report:entity", query);
        if let Some(hit) = self.cache.get_json(&key).await {
            return Ok(hit);
        }
        let report = self.reporting.entity_report(query).await?;
        self.cache
            .set_json(&key, &report, Some(PROVIDER_REPORT_TTL_SECS))
            .await;
        Ok(report)
    }

    pub async fn conversions(&self, query: &Value) -> Result<Value, ProviderError> {
        let key = self.cache.hashed_key("report:conversions", query);
        if let Some(hit) = self.cache.get_json(&key).await {
            return Ok(hit);
        }
        let report = self.reporting.conversions(query).await?;
        self.cache
            .set_json(&key, &report, Some(PROVIDER_REPORT_TTL_SECS))
            .await;
        Ok(report)
    }

    pub async fn conversion(&self, conversion_id: &str) -> Result<Value, ProviderError> {
        let key = self.cache.key("report:conversion", &[conversion_id]);
        if let Some(hit) = self.cache.get_json(&key).await {
            return Ok(hit);
        }
        let conversion = self.reporting.conversion(conversion_id).await?;
        self.cache
            .set_json(&key, &conversion, Some(PROVIDER_REPORT_TTL_SECS))
            .await;
        Ok(conversion)
    }

    pub async fn export_conversions(&self, query: &Value) -> Result<Value, ProviderError> {
        self.reporting.export_conversions(query).await
    }

    pub async fn dashboard_summary(&self, query: &Value) -> Result<Value, ProviderError> {
        let key = self.cache.hashed_key("report:dashboard", query);
        if let Some(hit) = self.cache.get_json(&key).await {
            return Ok(hit);
        }
        let summary = self.reporting.dashboard_summary(query).await?;
        self.cache
            .set_json(&key, &summary, Some(DASHBOARD_TTL_SECS))
            .await;
        Ok(summary)
    }

    /// Uncached access for aggregation jobs that must see fresh numbers.
    pub fn source(&self) -> Arc<dyn ProviderReporting> {
        Arc::clone(&self.reporting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingReporting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderReporting for CountingReporting {
        async fn entity_report(&self, _query: &Value) -> Result<Value, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "table": [] }))
        }
        async fn conversions(&self, _query: &Value) -> Result<Value, ProviderError> {
            Err(ProviderError::Api {
                status: 400,
                message: "bad range".into(),
            })
        }
        async fn conversion(&self, id: &str) -> Result<Value, ProviderError> {
            Ok(json!({ "conversion_id": id }))
        }
        async fn export_conversions(&self, _query: &Value) -> Result<Value, ProviderError> {
            Ok(json!({}))
        }
        async fn dashboard_summary(&self, _query: &Value) -> Result<Value, ProviderError> {
            Ok(json!({ "clicks": 3 }))
        }
    }

    #[tokio::test]
    async fn test_disabled_cache_always_reaches_provider() {
        let source = Arc::new(CountingReporting::default());
        let service = ReportingService::new(source.clone(), OpportunisticCache::disabled());
        let query = daily_entity_query(NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
        service.entity_report(&query).await.unwrap();
        service.entity_report(&query).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_provider_errors_pass_through() {
        let service =
            ReportingService::new(Arc::new(CountingReporting::default()), OpportunisticCache::disabled());
        let err = service.conversions(&json!({})).await.unwrap_err();
        assert_eq!(err.provider_message(), "bad range");
    }

    #[test]
    fn test_daily_query_spans_one_day() {
        let query = daily_entity_query(NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
        assert_eq!(query["from"], "2025-03-14");
        assert_eq!(query["to"], "2025-03-14");
        assert_eq!(query["columns"][1]["column"], "affiliate");
    }
}
