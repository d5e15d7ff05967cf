diesel::table! {
    organizations (organization_id) {
        organization_id -> Int8,
        name -> Text,
        #[sql_name = "type"]
        org_type -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    profiles (profile_id) {
        profile_id -> Uuid,
        organization_id -> Nullable<Int8>,
        email -> Text,
        first_name -> Nullable<Text>,
        last_name -> Nullable<Text>,
        role -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    advertisers (advertiser_id) {
        advertiser_id -> Int8,
        organization_id -> Int8,
        name -> Text,
        contact_email -> Nullable<Text>,
        status -> Text,
        internal_notes -> Nullable<Text>,
        default_currency_id -> Nullable<Text>,
        platform_name -> Nullable<Text>,
        billing_details -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    affiliates (affiliate_id) {
        affiliate_id -> Int8,
        organization_id -> Int8,
        name -> Text,
        contact_email -> Nullable<Text>,
        status -> Text,
        internal_notes -> Nullable<Text>,
        default_currency_id -> Nullable<Text>,
        payment_details -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    campaigns (campaign_id) {
        campaign_id -> Int8,
        organization_id -> Int8,
        advertiser_id -> Int8,
        name -> Text,
        description -> Nullable<Text>,
        status -> Text,
        start_date -> Nullable<Timestamptz>,
        end_date -> Nullable<Timestamptz>,
        destination_url -> Nullable<Text>,
        visibility -> Nullable<Text>,
        currency_id -> Nullable<Text>,
        payout_type -> Nullable<Text>,
        payout_amount -> Nullable<Numeric>,
        revenue_type -> Nullable<Text>,
        revenue_amount -> Nullable<Numeric>,
        billing_model -> Nullable<Text>,
        daily_conversion_cap -> Nullable<Int4>,
        global_conversion_cap -> Nullable<Int4>,
        session_duration -> Nullable<Int4>,
        internal_notes -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tracking_links (tracking_link_id) {
        tracking_link_id -> Int8,
        organization_id -> Int8,
        campaign_id -> Int8,
        affiliate_id -> Int8,
        name -> Text,
        description -> Nullable<Text>,
        status -> Text,
        tracking_url -> Nullable<Text>,
        source_id -> Nullable<Text>,
        sub1 -> Nullable<Text>,
        sub2 -> Nullable<Text>,
        sub3 -> Nullable<Text>,
        sub4 -> Nullable<Text>,
        sub5 -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    publisher_lists (list_id) {
        list_id -> Int8,
        organization_id -> Int8,
        name -> Text,
        description -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    publisher_list_items (item_id) {
        item_id -> Int8,
        list_id -> Int8,
        publisher_domain -> Text,
        notes -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(advertisers -> organizations (organization_id));
diesel::joinable!(affiliates -> organizations (organization_id));
diesel::joinable!(campaigns -> advertisers (advertiser_id));
diesel::joinable!(tracking_links -> campaigns (campaign_id));
diesel::joinable!(publisher_list_items -> publisher_lists (list_id));

diesel::allow_tables_to_appear_in_same_query!(
    organizations,
    profiles,
    advertisers,
    affiliates,
    campaigns,
    tracking_links,
    publisher_lists,
    publisher_list_items,
);
