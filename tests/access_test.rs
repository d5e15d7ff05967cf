mod common;

#[cfg(test)]
mod access_integration_tests {
    use super::common::{organization, test_pool};
    use affiliate_backend::access::{
        AssociationService, CreateDelegationRequest, CreateInvitationRequest, DelegationService,
        InvitationService, RedemptionRequest, VisibilityUpdate,
    };
    use affiliate_backend::core::shared::enums::{
        AssociationStatus, DelegationPermission, DelegationStatus, InvitationStatus,
        OrganizationType,
    };
    use affiliate_backend::core::shared::error::{Classify, ErrorKind};
    use affiliate_backend::core::shared::schema::{agency_delegations, invitations};
    use affiliate_backend::entities::EntityStore;
    use chrono::{Duration, Utc};
    use diesel::prelude::*;
    use uuid::Uuid;

    fn invitation_request(advertiser_org_id: i64, max_uses: i32) -> CreateInvitationRequest {
        CreateInvitationRequest {
            advertiser_org_id,
            name: "Partner program".to_string(),
            description: None,
            allowed_affiliate_org_ids: None,
            max_uses,
            expires_at: Some(Utc::now() + Duration::days(7)),
            default_all_affiliates_visible: true,
            default_all_campaigns_visible: false,
            default_visible_affiliate_ids: None,
            default_visible_campaign_ids: Some(vec![]),
            message: None,
        }
    }

    fn redemption(token: &str, affiliate_org_id: i64) -> RedemptionRequest {
        RedemptionRequest {
            token: token.to_string(),
            affiliate_org_id,
            user_id: Some(Uuid::new_v4()),
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: Some("integration-test".to_string()),
        }
    }

    #[tokio::test]
    async fn test_single_use_invitation_race() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let advertiser = organization(&store, OrganizationType::Advertiser).await;
        let first = organization(&store, OrganizationType::Affiliate).await;
        let second = organization(&store, OrganizationType::Affiliate).await;

        let service = InvitationService::new(pool.clone());
        let invitation = service
            .create_invitation(invitation_request(advertiser.organization_id, 1), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(invitation.status, InvitationStatus::Active);

        let (a, b) = tokio::join!(
            service.redeem(redemption(&invitation.token, first.organization_id)),
            service.redeem(redemption(&invitation.token, second.organization_id)),
        );
        let (winner, loser) = match (a, b) {
            (Ok(win), Err(lose)) | (Err(lose), Ok(win)) => (win, lose),
            other => panic!("expected exactly one redemption to succeed: {:?}", other),
        };
        assert_eq!(loser.kind(), ErrorKind::InvalidState);
        assert_eq!(winner.association.status, AssociationStatus::Active);
        assert!(winner.association.approved_at.is_some());
        assert!(!winner.association.all_campaigns_visible);

        let stored = service.get_invitation(invitation.invitation_id).await.unwrap();
        assert_eq!(stored.current_uses, 1);
        assert_eq!(stored.status, InvitationStatus::Exhausted);

        let log = service.usage_history(invitation.invitation_id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().filter(|u| u.success).count(), 1);
        let failure = log.iter().find(|u| !u.success).unwrap();
        assert!(failure.error_message.is_some());
        assert!(failure.association_id.is_none());
    }

    #[tokio::test]
    async fn test_allow_list_and_type_checks() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let advertiser = organization(&store, OrganizationType::Advertiser).await;
        let invited = organization(&store, OrganizationType::Affiliate).await;
        let outsider = organization(&store, OrganizationType::Affiliate).await;

        let service = InvitationService::new(pool.clone());
        let mut request = invitation_request(advertiser.organization_id, 5);
        request.allowed_affiliate_org_ids = Some(vec![invited.organization_id]);
        let invitation = service.create_invitation(request, Uuid::new_v4()).await.unwrap();

        let err = service
            .redeem(redemption(&invitation.token, outsider.organization_id))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Your organization is not allowed to use this invitation"
        );
        service
            .redeem(redemption(&invitation.token, invited.organization_id))
            .await
            .unwrap();

        let revoked = service.revoke_invitation(invitation.invitation_id).await.unwrap();
        assert_eq!(revoked.status, InvitationStatus::Revoked);
        assert!(service.revoke_invitation(invitation.invitation_id).await.is_err());

        let affiliate_invite = service
            .create_invitation(invitation_request(invited.organization_id, 1), Uuid::new_v4())
            .await;
        assert!(affiliate_invite.is_err());
    }

    #[tokio::test]
    async fn test_empty_allow_list_admits_nobody() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let advertiser = organization(&store, OrganizationType::Advertiser).await;
        let affiliate = organization(&store, OrganizationType::Affiliate).await;

        let service = InvitationService::new(pool.clone());
        let mut request = invitation_request(advertiser.organization_id, 3);
        request.allowed_affiliate_org_ids = Some(vec![]);
        let invitation = service.create_invitation(request, Uuid::new_v4()).await.unwrap();

        let err = service
            .redeem(redemption(&invitation.token, affiliate.organization_id))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let stored = service.get_invitation(invitation.invitation_id).await.unwrap();
        assert_eq!(stored.current_uses, 0);
    }

    #[tokio::test]
    async fn test_redeem_respects_existing_association() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let advertiser = organization(&store, OrganizationType::Advertiser).await;
        let affiliate = organization(&store, OrganizationType::Affiliate).await;
        let requester = organization(&store, OrganizationType::Affiliate).await;
        let service = InvitationService::new(pool.clone());
        let associations = AssociationService::new(pool.clone());

        let invitation = service
            .create_invitation(invitation_request(advertiser.organization_id, 2), Uuid::new_v4())
            .await
            .unwrap();
        let first = service
            .redeem(redemption(&invitation.token, affiliate.organization_id))
            .await
            .unwrap();

        // Already active: no use is consumed.
        let err = service
            .redeem(redemption(&invitation.token, affiliate.organization_id))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let stored = service.get_invitation(invitation.invitation_id).await.unwrap();
        assert_eq!(stored.current_uses, 1);
        assert_eq!(stored.status, InvitationStatus::Active);

        // Suspension is not lifted by redeeming again.
        associations.suspend(first.association.association_id).await.unwrap();
        assert!(service
            .redeem(redemption(&invitation.token, affiliate.organization_id))
            .await
            .is_err());
        let association = associations
            .get_association(first.association.association_id)
            .await
            .unwrap();
        assert_eq!(association.status, AssociationStatus::Suspended);

        // A pending request is upgraded in place.
        let pending = associations
            .create_request(requester.organization_id, advertiser.organization_id, None, None)
            .await
            .unwrap();
        let upgraded = service
            .redeem(redemption(&invitation.token, requester.organization_id))
            .await
            .unwrap();
        assert_eq!(upgraded.association.association_id, pending.association_id);
        assert_eq!(upgraded.association.status, AssociationStatus::Active);
        assert_eq!(upgraded.invitation.status, InvitationStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_expire_invitations_sweeps_past_due() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let advertiser = organization(&store, OrganizationType::Advertiser).await;
        let service = InvitationService::new(pool.clone());

        let stale = service
            .create_invitation(invitation_request(advertiser.organization_id, 1), Uuid::new_v4())
            .await
            .unwrap();
        let fresh = service
            .create_invitation(invitation_request(advertiser.organization_id, 1), Uuid::new_v4())
            .await
            .unwrap();
        let mut conn = pool.get().unwrap();
        diesel::update(invitations::table.find(stale.invitation_id))
            .set(invitations::expires_at.eq(Some(Utc::now() - Duration::minutes(1))))
            .execute(&mut conn)
            .unwrap();

        assert!(service.expire_invitations().await.unwrap() >= 1);
        assert_eq!(
            service.get_invitation(stale.invitation_id).await.unwrap().status,
            InvitationStatus::Expired
        );
        assert_eq!(
            service.get_invitation(fresh.invitation_id).await.unwrap().status,
            InvitationStatus::Active
        );
        let err = service
            .redeem(redemption(&stale.token, advertiser.organization_id))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invitation is not active");
    }

    #[tokio::test]
    async fn test_association_request_lifecycle() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let advertiser = organization(&store, OrganizationType::Advertiser).await;
        let affiliate = organization(&store, OrganizationType::Affiliate).await;
        let associations = AssociationService::new(pool.clone());

        let pending = associations
            .create_request(affiliate.organization_id, advertiser.organization_id, None, None)
            .await
            .unwrap();
        assert_eq!(pending.status, AssociationStatus::Pending);
        assert!(pending.approved_at.is_none());

        let duplicate = associations
            .create_request(affiliate.organization_id, advertiser.organization_id, None, None)
            .await
            .unwrap_err();
        assert_eq!(duplicate.kind(), ErrorKind::Conflict);

        assert!(associations
            .update_visibility(pending.association_id, VisibilityUpdate::default())
            .await
            .is_err());

        let active = associations
            .approve(pending.association_id, Some(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(active.status, AssociationStatus::Active);
        let approved_at = active.approved_at.unwrap();

        let suspended = associations.suspend(active.association_id).await.unwrap();
        assert_eq!(suspended.status, AssociationStatus::Suspended);
        let again = associations.reactivate(active.association_id).await.unwrap();
        assert_eq!(again.approved_at, Some(approved_at));

        let narrowed = associations
            .update_visibility(
                active.association_id,
                VisibilityUpdate {
                    all_campaigns_visible: Some(false),
                    visible_campaign_ids: Some(vec![]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!narrowed.all_campaigns_visible);
        let campaigns = associations
            .visible_campaigns(active.association_id)
            .await
            .unwrap();
        assert!(campaigns.is_empty());
    }

    #[tokio::test]
    async fn test_delegation_lifecycle_and_expiry() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - DATABASE_URL not set");
            return;
        };
        let store = EntityStore::new(pool.clone());
        let agency = organization(&store, OrganizationType::Agency).await;
        let advertiser = organization(&store, OrganizationType::Advertiser).await;
        let delegations = DelegationService::new(pool.clone());

        let bad = delegations
            .create_delegation(
                CreateDelegationRequest {
                    agency_org_id: agency.organization_id,
                    advertiser_org_id: advertiser.organization_id,
                    permissions: vec!["campaign_view".into(), "fly_rockets".into()],
                    message: None,
                    expires_at: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(bad.to_string(), "invalid permission: fly_rockets");

        let delegation = delegations
            .create_delegation(
                CreateDelegationRequest {
                    agency_org_id: agency.organization_id,
                    advertiser_org_id: advertiser.organization_id,
                    permissions: vec!["campaign_view".into(), "analytics_view".into()],
                    message: Some("Q3 management".into()),
                    expires_at: Some(Utc::now() + Duration::days(30)),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(delegation.status, DelegationStatus::Pending);
        assert!(!delegations
            .has_permission(
                agency.organization_id,
                advertiser.organization_id,
                DelegationPermission::CampaignView
            )
            .await
            .unwrap());

        let accepted = delegations
            .accept(delegation.delegation_id, Some(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(accepted.status, DelegationStatus::Active);
        assert!(accepted.accepted_at.is_some());

        let checks = delegations
            .check_permissions(
                agency.organization_id,
                advertiser.organization_id,
                vec![
                    DelegationPermission::CampaignView,
                    DelegationPermission::BillingManage,
                ],
            )
            .await
            .unwrap();
        assert!(checks[&DelegationPermission::CampaignView]);
        assert!(!checks[&DelegationPermission::BillingManage]);

        let mut conn = pool.get().unwrap();
        diesel::update(agency_delegations::table.find(delegation.delegation_id))
            .set(agency_delegations::expires_at.eq(Some(Utc::now() - Duration::minutes(1))))
            .execute(&mut conn)
            .unwrap();
        drop(conn);

        assert!(delegations
            .active_permissions(agency.organization_id, advertiser.organization_id)
            .await
            .unwrap()
            .is_empty());
        assert!(delegations.expire_delegations().await.unwrap() >= 1);
        let swept = delegations.get_delegation(delegation.delegation_id).await.unwrap();
        assert_eq!(swept.status, DelegationStatus::Revoked);
    }
}
