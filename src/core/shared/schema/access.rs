diesel::table! {
    organization_associations (association_id) {
        association_id -> Int8,
        advertiser_org_id -> Int8,
        affiliate_org_id -> Int8,
        status -> Text,
        association_type -> Text,
        all_affiliates_visible -> Bool,
        all_campaigns_visible -> Bool,
        visible_affiliate_ids -> Nullable<Jsonb>,
        visible_campaign_ids -> Nullable<Jsonb>,
        requested_by_user_id -> Nullable<Uuid>,
        approved_by_user_id -> Nullable<Uuid>,
        message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        approved_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    invitations (invitation_id) {
        invitation_id -> Int8,
        advertiser_org_id -> Int8,
        name -> Text,
        description -> Nullable<Text>,
        token -> Text,
        allowed_affiliate_org_ids -> Nullable<Jsonb>,
        max_uses -> Int4,
        current_uses -> Int4,
        expires_at -> Nullable<Timestamptz>,
        status -> Text,
        default_all_affiliates_visible -> Bool,
        default_all_campaigns_visible -> Bool,
        default_visible_affiliate_ids -> Nullable<Jsonb>,
        default_visible_campaign_ids -> Nullable<Jsonb>,
        created_by_user_id -> Uuid,
        message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    invitation_usage_log (usage_id) {
        usage_id -> Int8,
        invitation_id -> Int8,
        affiliate_org_id -> Nullable<Int8>,
        used_by_user_id -> Nullable<Uuid>,
        association_id -> Nullable<Int8>,
        ip_address -> Nullable<Text>,
        user_agent -> Nullable<Text>,
        success -> Bool,
        error_message -> Nullable<Text>,
        used_at -> Timestamptz,
    }
}

diesel::table! {
    agency_delegations (delegation_id) {
        delegation_id -> Int8,
        agency_org_id -> Int8,
        advertiser_org_id -> Int8,
        status -> Text,
        permissions -> Jsonb,
        delegated_by_user_id -> Nullable<Uuid>,
        accepted_by_user_id -> Nullable<Uuid>,
        message -> Nullable<Text>,
        expires_at -> Nullable<Timestamptz>,
        accepted_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(invitation_usage_log -> invitations (invitation_id));

diesel::allow_tables_to_appear_in_same_query!(
    organization_associations,
    invitations,
    invitation_usage_log,
    agency_delegations,
);
