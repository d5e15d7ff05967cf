mod common;

#[cfg(test)]
mod billing_integration_tests {
    use super::common::{organization, test_pool};
    use affiliate_backend::billing::stripe_integration::sign_payload;
    use affiliate_backend::billing::{
        AccountService, ActivitySource, BillingConfigUpdate, BillingError, CampaignActivity,
        IngestOutcome, Ledger, NewLedgerEntry, UsageAggregator, UsageOutcome, WebhookProcessor,
    };
    use affiliate_backend::cache::OpportunisticCache;
    use affiliate_backend::core::shared::enums::{
        BillingMode, BillingModel, EntityStatus, OrganizationType, TransactionType,
        UsageRecordStatus, WebhookEventStatus,
    };
    use affiliate_backend::core::shared::error::{Classify, ErrorKind};
    use affiliate_backend::core::shared::utils::DbPool;
    use affiliate_backend::entities::{Campaign, EntityStore, NewAdvertiser, NewCampaign, Organization};
    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use chrono::{NaiveDate, Utc};
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::Arc;

    const WEBHOOK_SECRET: &str = "whsec_integration";

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn services(pool: &DbPool) -> (Ledger, AccountService) {
        let ledger = Ledger::new(pool.clone(), None);
        let accounts = AccountService::new(
            pool.clone(),
            None,
            OpportunisticCache::disabled(),
            ledger.clone(),
        );
        (ledger, accounts)
    }

    #[tokio::test]
    async fn test_prepaid_overdraft_is_rejected() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let org = organization(&store, OrganizationType::Advertiser).await;
        let (ledger, accounts) = services(&pool);
        accounts.get_or_create_account(org.organization_id).await.unwrap();
        ledger
            .append(NewLedgerEntry::new(org.organization_id, TransactionType::Credit, dec("10.00")))
            .await
            .unwrap();

        let err = ledger
            .append(NewLedgerEntry::new(
                org.organization_id,
                TransactionType::UsageCharge,
                dec("-15.00"),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let account = accounts.get_account(org.organization_id).await.unwrap();
        assert_eq!(account.balance, dec("10.00"));
        let history = accounts
            .transaction_history(org.organization_id, 50, 0)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].transaction_type, TransactionType::Credit);

        let audit = ledger.audit_balance(account.billing_account_id).await.unwrap();
        assert!(audit.consistent);
    }

    #[tokio::test]
    async fn test_sign_rules_are_enforced() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let org = organization(&store, OrganizationType::Advertiser).await;
        let (ledger, accounts) = services(&pool);
        accounts.get_or_create_account(org.organization_id).await.unwrap();

        let err = ledger
            .append(NewLedgerEntry::new(org.organization_id, TransactionType::Debit, dec("5")))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
        let recharge = ledger
            .recharge(org.organization_id, dec("40.00"), None)
            .await
            .unwrap();
        assert_eq!(recharge.balance_after, dec("40.00"));
    }

    #[tokio::test]
    async fn test_webhook_replay_applies_once() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let org = organization(&store, OrganizationType::Advertiser).await;
        let (_, accounts) = services(&pool);
        accounts.get_or_create_account(org.organization_id).await.unwrap();

        let event_id = format!("evt_{}", uuid::Uuid::new_v4().simple());
        let payload = json!({
            "id": event_id,
            "type": "payment_intent.succeeded",
            "created": Utc::now().timestamp(),
            "data": { "object": {
                "id": format!("pi_{}", uuid::Uuid::new_v4().simple()),
                "object": "payment_intent",
                "amount": 2500,
                "amount_received": 2500,
                "currency": "usd",
                "status": "succeeded",
                "metadata": { "organization_id": org.organization_id.to_string() }
            }}
        })
        .to_string();
        let header = sign_payload(&payload, WEBHOOK_SECRET, Utc::now().timestamp()).unwrap();

        let processor = WebhookProcessor::new(pool.clone(), Some(WEBHOOK_SECRET.to_string()));
        let (a, b) = tokio::join!(
            processor.ingest(&payload, Some(&header)),
            processor.ingest(&payload, Some(&header)),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, IngestOutcome::Processed { .. }))
                .count(),
            1
        );
        assert!(outcomes.contains(&IngestOutcome::Duplicate));

        let event = processor.get_event(&event_id).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookEventStatus::Processed);
        assert_eq!(event.organization_id, Some(org.organization_id));
        assert!(event.transaction_id.is_some());

        let history = accounts
            .transaction_history(org.organization_id, 50, 0)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].transaction_type, TransactionType::Recharge);
        assert_eq!(history[0].amount, dec("25.00"));
    }

    #[tokio::test]
    async fn test_concurrent_retries_apply_refund_once() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let org = organization(&store, OrganizationType::Advertiser).await;
        let (ledger, accounts) = services(&pool);

        let event_id = format!("evt_{}", uuid::Uuid::new_v4().simple());
        let charge_id = format!("ch_{}", uuid::Uuid::new_v4().simple());
        let payload = json!({
            "id": event_id,
            "type": "charge.refunded",
            "created": Utc::now().timestamp(),
            "data": { "object": {
                "id": charge_id,
                "object": "charge",
                "amount_refunded": 1000,
                "metadata": { "organization_id": org.organization_id.to_string() }
            }}
        })
        .to_string();
        let processor = WebhookProcessor::new(pool.clone(), None);

        // No billing account yet, so the refund cannot be applied.
        let outcome = processor.ingest(&payload, None).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Deferred { .. }));

        accounts.get_or_create_account(org.organization_id).await.unwrap();
        ledger
            .recharge(org.organization_id, dec("100.00"), None)
            .await
            .unwrap();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let processor = processor.clone();
                tokio::spawn(async move { processor.retry_pending(100).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let event = processor.get_event(&event_id).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookEventStatus::Processed);
        let history = accounts
            .transaction_history(org.organization_id, 50, 0)
            .await
            .unwrap();
        let refunds: Vec<_> = history
            .iter()
            .filter(|t| t.transaction_type == TransactionType::Refund)
            .collect();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, dec("-10.00"));
        let account = accounts.get_account(org.organization_id).await.unwrap();
        assert_eq!(account.balance, dec("90.00"));
    }

    #[tokio::test]
    async fn test_forged_webhook_is_rejected() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let processor = WebhookProcessor::new(pool, Some(WEBHOOK_SECRET.to_string()));
        let payload = r#"{"id":"evt_forged","type":"charge.refunded","data":{"object":{}}}"#;
        let header = sign_payload(payload, "whsec_other", Utc::now().timestamp()).unwrap();
        let err = processor.ingest(payload, Some(&header)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(processor.get_event("evt_forged").await.unwrap().is_none());
    }

    struct FixedActivity {
        organization_id: i64,
        activity: Vec<CampaignActivity>,
    }

    #[async_trait]
    impl ActivitySource for FixedActivity {
        async fn daily_activity(
            &self,
            organization_id: i64,
            _date: NaiveDate,
        ) -> Result<Vec<CampaignActivity>, BillingError> {
            if organization_id == self.organization_id {
                Ok(self.activity.clone())
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[tokio::test]
    async fn test_daily_usage_charges_prepaid_account() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let org = organization(&store, OrganizationType::Advertiser).await;
        let advertiser = store
            .create_advertiser(NewAdvertiser {
                organization_id: org.organization_id,
                name: "Usage Co".to_string(),
                status: EntityStatus::Active,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut new_campaign =
            NewCampaign::draft(org.organization_id, advertiser.advertiser_id, "CPC offer");
        new_campaign.status = EntityStatus::Active;
        new_campaign.billing_model = Some(BillingModel::Click);
        new_campaign.revenue_amount = Some(dec("0.50"));
        new_campaign.payout_amount = Some(dec("0.30"));
        let campaign = store.create_campaign(new_campaign).await.unwrap();

        let (ledger, accounts) = services(&pool);
        let account = accounts.get_or_create_account(org.organization_id).await.unwrap();
        ledger
            .recharge(org.organization_id, dec("100.00"), None)
            .await
            .unwrap();

        let source = Arc::new(FixedActivity {
            organization_id: org.organization_id,
            activity: vec![CampaignActivity {
                campaign_id: campaign.campaign_id,
                affiliate_id: None,
                clicks: 100,
                conversions: 3,
                impressions: 1000,
            }],
        });
        let usage = UsageAggregator::new(pool.clone(), accounts.clone(), source);
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();

        let account = accounts.get_account(account.organization_id).await.unwrap();
        usage.process_account(&account, date).await.unwrap();
        let record = usage
            .get_record(org.organization_id, date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, UsageRecordStatus::Billed);
        assert_eq!(record.advertiser_spend, dec("50.00"));
        assert_eq!(record.affiliate_payout, dec("30.00"));
        assert_eq!(record.platform_revenue, dec("20.00"));
        assert!(record.campaign_breakdown
            .get(format!("campaign_{}", campaign.campaign_id))
            .is_some());

        let account = accounts.get_account(org.organization_id).await.unwrap();
        assert_eq!(account.balance, dec("50.00"));

        // A second run for the same day is a no-op.
        usage.process_account(&account, date).await.unwrap();
        let account = accounts.get_account(org.organization_id).await.unwrap();
        assert_eq!(account.balance, dec("50.00"));
        assert!(ledger.audit_balance(account.billing_account_id).await.unwrap().consistent);
    }

    /// CPC campaign at 0.50 revenue / 0.30 payout per click.
    async fn priced_campaign(store: &EntityStore, org: &Organization) -> Campaign {
        let advertiser = store
            .create_advertiser(NewAdvertiser {
                organization_id: org.organization_id,
                name: "Priced Co".to_string(),
                status: EntityStatus::Active,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut new_campaign =
            NewCampaign::draft(org.organization_id, advertiser.advertiser_id, "CPC offer");
        new_campaign.status = EntityStatus::Active;
        new_campaign.billing_model = Some(BillingModel::Click);
        new_campaign.revenue_amount = Some(dec("0.50"));
        new_campaign.payout_amount = Some(dec("0.30"));
        store.create_campaign(new_campaign).await.unwrap()
    }

    fn clicks(organization_id: i64, campaign: &Campaign, clicks: i64) -> Arc<FixedActivity> {
        Arc::new(FixedActivity {
            organization_id,
            activity: vec![CampaignActivity {
                campaign_id: campaign.campaign_id,
                affiliate_id: None,
                clicks,
                conversions: 0,
                impressions: 0,
            }],
        })
    }

    #[tokio::test]
    async fn test_overlapping_usage_runs_charge_once() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let org = organization(&store, OrganizationType::Advertiser).await;
        let campaign = priced_campaign(&store, &org).await;
        let (ledger, accounts) = services(&pool);
        accounts.get_or_create_account(org.organization_id).await.unwrap();
        ledger
            .recharge(org.organization_id, dec("100.00"), None)
            .await
            .unwrap();
        let account = accounts.get_account(org.organization_id).await.unwrap();

        let usage = UsageAggregator::new(
            pool.clone(),
            accounts.clone(),
            clicks(org.organization_id, &campaign, 40),
        );
        let date = NaiveDate::from_ymd_opt(2026, 4, 2).unwrap();
        let (a, b) = tokio::join!(
            usage.process_account(&account, date),
            usage.process_account(&account, date),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert!(outcomes.contains(&UsageOutcome::Billed));
        assert!(outcomes.contains(&UsageOutcome::Skipped));

        let record = usage
            .get_record(org.organization_id, date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, UsageRecordStatus::Billed);
        assert_eq!(record.clicks, 40);
        let account = accounts.get_account(org.organization_id).await.unwrap();
        assert_eq!(account.balance, dec("80.00"));
        assert!(ledger.audit_balance(account.billing_account_id).await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_paid_invoice_only_bills_its_organization() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let owner = organization(&store, OrganizationType::Advertiser).await;
        let other = organization(&store, OrganizationType::Advertiser).await;
        let campaign = priced_campaign(&store, &owner).await;
        let (_, accounts) = services(&pool);
        accounts.get_or_create_account(owner.organization_id).await.unwrap();
        accounts.get_or_create_account(other.organization_id).await.unwrap();
        let account = accounts
            .update_config(
                owner.organization_id,
                BillingConfigUpdate {
                    billing_mode: Some(BillingMode::Postpaid),
                    credit_limit: Some(dec("500.00")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let usage = UsageAggregator::new(
            pool.clone(),
            accounts.clone(),
            clicks(owner.organization_id, &campaign, 10),
        );
        let date = NaiveDate::from_ymd_opt(2026, 4, 3).unwrap();
        let outcome = usage.process_account(&account, date).await.unwrap();
        assert_eq!(outcome, UsageOutcome::Allocated);
        let record = usage
            .get_record(owner.organization_id, date)
            .await
            .unwrap()
            .unwrap();

        let processor = WebhookProcessor::new(pool.clone(), None);
        let invoice = |organization_id: i64| {
            json!({
                "id": format!("evt_{}", uuid::Uuid::new_v4().simple()),
                "type": "invoice.paid",
                "created": Utc::now().timestamp(),
                "data": { "object": {
                    "id": format!("in_{}", uuid::Uuid::new_v4().simple()),
                    "object": "invoice",
                    "metadata": {
                        "organization_id": organization_id.to_string(),
                        "usage_record_ids": record.usage_record_id.to_string()
                    }
                }}
            })
            .to_string()
        };

        processor.ingest(&invoice(other.organization_id), None).await.unwrap();
        let unchanged = usage
            .get_record(owner.organization_id, date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.status, UsageRecordStatus::Allocated);

        processor.ingest(&invoice(owner.organization_id), None).await.unwrap();
        let billed = usage
            .get_record(owner.organization_id, date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(billed.status, UsageRecordStatus::Billed);
        assert!(billed.billed_at.is_some());
    }
}
