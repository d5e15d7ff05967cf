diesel::table! {
    billing_accounts (billing_account_id) {
        billing_account_id -> Int8,
        organization_id -> Int8,
        stripe_customer_id -> Nullable<Text>,
        billing_mode -> Text,
        currency -> Text,
        balance -> Numeric,
        credit_limit -> Numeric,
        default_payment_method_id -> Nullable<Text>,
        auto_recharge_enabled -> Bool,
        auto_recharge_threshold -> Numeric,
        auto_recharge_amount -> Numeric,
        invoice_day_of_month -> Nullable<Int4>,
        payment_terms_days -> Int4,
        status -> Text,
        billing_email -> Nullable<Text>,
        billing_address -> Jsonb,
        tax_info -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    transactions (transaction_id) {
        transaction_id -> Int8,
        organization_id -> Int8,
        billing_account_id -> Int8,
        #[sql_name = "type"]
        transaction_type -> Text,
        amount -> Numeric,
        currency -> Text,
        balance_before -> Numeric,
        balance_after -> Numeric,
        reference_type -> Nullable<Text>,
        reference_id -> Nullable<Text>,
        related_transaction_id -> Nullable<Int8>,
        stripe_payment_intent_id -> Nullable<Text>,
        stripe_invoice_id -> Nullable<Text>,
        stripe_charge_id -> Nullable<Text>,
        description -> Nullable<Text>,
        metadata -> Jsonb,
        status -> Text,
        processed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    usage_records (usage_record_id) {
        usage_record_id -> Int8,
        organization_id -> Int8,
        billing_account_id -> Int8,
        usage_date -> Date,
        clicks -> Int8,
        conversions -> Int8,
        impressions -> Int8,
        advertiser_spend -> Numeric,
        affiliate_payout -> Numeric,
        platform_revenue -> Numeric,
        currency -> Text,
        status -> Text,
        allocated_at -> Nullable<Timestamptz>,
        billed_at -> Nullable<Timestamptz>,
        campaign_breakdown -> Jsonb,
        affiliate_breakdown -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_events (webhook_event_id) {
        webhook_event_id -> Int8,
        stripe_event_id -> Text,
        event_type -> Text,
        status -> Text,
        event_data -> Jsonb,
        processed_at -> Nullable<Timestamptz>,
        error_message -> Nullable<Text>,
        retry_count -> Int4,
        organization_id -> Nullable<Int8>,
        transaction_id -> Nullable<Int8>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(transactions -> billing_accounts (billing_account_id));
diesel::joinable!(usage_records -> billing_accounts (billing_account_id));

diesel::allow_tables_to_appear_in_same_query!(
    billing_accounts,
    transactions,
    usage_records,
    webhook_events,
);
