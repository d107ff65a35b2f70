//! 令牌授权服务集成测试
//!
//! 覆盖密码授予、登录锁定、刷新令牌轮换、吊销与内省

use chrono::Duration;
use tenant_guard::{
    error::AppError,
    models::{directory::MembershipStatus, session::SessionKind},
};

mod common;
use common::{client, GrantOutcomeExt, TestHarness, ALICE, BOB, OTHER_TENANT, PASSWORD, SUSPENDED_TENANT, TENANT};

// ==================== 密码授予 ====================

#[tokio::test]
async fn test_password_grant_issues_token_pair() {
    let h = TestHarness::new();

    let tokens = h.login(ALICE).await;

    assert_eq!(tokens.token_type, "Bearer");
    assert_eq!(tokens.expires_in, 900);
    assert_eq!(tokens.refresh_expires_in, 604800);
    assert_ne!(tokens.access_token, tokens.refresh_token);
    assert_eq!(h.sessions.len(), 2);

    let claims = h.authority.introspect(&tokens.access_token).await.unwrap();
    assert_eq!(claims.user_id, h.alice);
    assert_eq!(claims.tenant_id.as_deref(), Some(TENANT));
    assert!(claims.permissions.contains(&"audit:verify".to_string()));

    assert_eq!(h.audit_count(TENANT, "auth.login.success"), 1);
}

#[tokio::test]
async fn test_wrong_password_and_unknown_user_are_indistinguishable() {
    let h = TestHarness::new();

    let wrong = h.password_grant(ALICE, "not-the-password", TENANT).await;
    assert!(matches!(wrong, Err(AppError::InvalidCredentials)));

    let unknown = h.password_grant("nobody", PASSWORD, TENANT).await;
    assert!(matches!(unknown, Err(AppError::InvalidCredentials)));

    assert!(h.sessions.is_empty());
    assert_eq!(h.audit_count(TENANT, "auth.login.failure"), 2);
}

#[tokio::test]
async fn test_tenant_and_membership_errors() {
    let h = TestHarness::new();

    // 租户被停用
    let result = h.password_grant(ALICE, PASSWORD, SUSPENDED_TENANT).await;
    assert!(matches!(result, Err(AppError::TenantInactive)));

    // 租户不存在
    let result = h.password_grant(ALICE, PASSWORD, "no-such-tenant").await;
    assert!(matches!(result, Err(AppError::TenantInactive)));

    // 用户不是该租户成员
    let result = h.password_grant(BOB, PASSWORD, OTHER_TENANT).await;
    assert!(matches!(result, Err(AppError::TenantInactive)));

    // 密码过期
    assert!(h
        .directory
        .set_membership_status(h.bob, TENANT, MembershipStatus::PasswordExpired));
    let result = h.password_grant(BOB, PASSWORD, TENANT).await;
    assert!(matches!(result, Err(AppError::PasswordExpired)));

    // 成员被锁定
    h.directory
        .set_membership_status(h.bob, TENANT, MembershipStatus::Locked);
    let result = h.password_grant(BOB, PASSWORD, TENANT).await;
    assert!(matches!(result, Err(AppError::AccountLocked)));

    assert!(h.sessions.is_empty());
}

// ==================== 登录锁定 ====================

#[tokio::test]
async fn test_lockout_after_five_failures() {
    let h = TestHarness::new();

    for _ in 0..5 {
        let result = h.password_grant(ALICE, "wrong", TENANT).await;
        assert!(matches!(result, Err(AppError::InvalidCredentials)));
    }

    // 正确的密码也被拒绝
    let result = h.password_grant(ALICE, PASSWORD, TENANT).await;
    assert!(matches!(result, Err(AppError::AccountLocked)));
    assert_eq!(h.audit_count(TENANT, "auth.account.locked"), 1);

    // 锁定期满后恢复
    h.clock.advance(Duration::seconds(1801));
    let result = h.password_grant(ALICE, PASSWORD, TENANT).await;
    assert!(result.unwrap().into_tokens().is_some());
}

#[tokio::test]
async fn test_locked_account_reported_during_directory_outage() {
    let h = TestHarness::new();

    for _ in 0..5 {
        let _ = h.password_grant(ALICE, "wrong", TENANT).await;
    }
    let recorded = h.audit_count(TENANT, "auth.login.failure");

    h.directory.set_unavailable(true);
    let result = h.password_grant(ALICE, PASSWORD, TENANT).await;
    assert!(matches!(result, Err(AppError::AccountLocked)));

    // 租户查不到时不写审计
    assert_eq!(h.audit_count(TENANT, "auth.login.failure"), recorded);

    h.directory.set_unavailable(false);
    let result = h.password_grant(ALICE, PASSWORD, TENANT).await;
    assert!(matches!(result, Err(AppError::AccountLocked)));
    assert_eq!(h.audit_count(TENANT, "auth.login.failure"), recorded + 1);
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let h = TestHarness::new();

    for _ in 0..4 {
        let _ = h.password_grant(ALICE, "wrong", TENANT).await;
    }
    assert_eq!(h.authority.lockout().attempts(ALICE).await.unwrap(), 4);

    h.login(ALICE).await;
    assert_eq!(h.authority.lockout().attempts(ALICE).await.unwrap(), 0);

    for _ in 0..4 {
        let _ = h.password_grant(ALICE, "wrong", TENANT).await;
    }
    let result = h.password_grant(ALICE, PASSWORD, TENANT).await;
    assert!(result.unwrap().into_tokens().is_some());
}

#[tokio::test]
async fn test_failure_window_starts_at_first_failure() {
    let h = TestHarness::new();

    for _ in 0..4 {
        let _ = h.password_grant(ALICE, "wrong", TENANT).await;
    }

    // 窗口过期后重新计数
    h.clock.advance(Duration::seconds(901));
    assert_eq!(h.authority.lockout().attempts(ALICE).await.unwrap(), 0);

    for _ in 0..4 {
        let _ = h.password_grant(ALICE, "wrong", TENANT).await;
    }
    let result = h.password_grant(ALICE, PASSWORD, TENANT).await;
    assert!(result.unwrap().into_tokens().is_some());
}

#[tokio::test]
async fn test_lockout_is_case_insensitive() {
    let h = TestHarness::new();

    for name in ["alice", "ALICE", "Alice", "aLiCe", "alicE"] {
        let _ = h.password_grant(name, "wrong", TENANT).await;
    }

    let result = h.password_grant(ALICE, PASSWORD, TENANT).await;
    assert!(matches!(result, Err(AppError::AccountLocked)));
}

// ==================== 刷新令牌轮换 ====================

#[tokio::test]
async fn test_refresh_rotation() {
    let h = TestHarness::new();
    let first = h.login(ALICE).await;

    let second = h.refresh(&first.refresh_token).await.unwrap();
    assert_ne!(second.refresh_token, first.refresh_token);
    assert_ne!(second.access_token, first.access_token);

    // 旧刷新令牌不可再用
    let reused = h.refresh(&first.refresh_token).await;
    assert!(matches!(reused, Err(AppError::InvalidToken)));

    // 新刷新令牌恰好还能用一次
    let third = h.refresh(&second.refresh_token).await.unwrap();
    assert!(matches!(
        h.refresh(&second.refresh_token).await,
        Err(AppError::InvalidToken)
    ));

    let claims = h.authority.introspect(&third.access_token).await.unwrap();
    assert_eq!(claims.user_id, h.alice);
    assert_eq!(h.audit_count(TENANT, "token.refreshed"), 2);
}

#[tokio::test]
async fn test_access_token_cannot_refresh() {
    let h = TestHarness::new();
    let tokens = h.login(ALICE).await;

    let result = h.refresh(&tokens.access_token).await;
    assert!(matches!(result, Err(AppError::InvalidToken)));

    // 刷新令牌也不能当作访问令牌
    let result = h.authority.introspect(&tokens.refresh_token).await;
    assert!(matches!(result, Err(AppError::InvalidToken)));
}

#[tokio::test]
async fn test_expired_refresh_token_rejected() {
    let h = TestHarness::new();
    let tokens = h.login(ALICE).await;

    h.clock.advance(Duration::seconds(604801));
    let result = h.refresh(&tokens.refresh_token).await;
    assert!(matches!(result, Err(AppError::InvalidToken)));
}

#[tokio::test]
async fn test_refresh_rechecks_membership() {
    let h = TestHarness::new();
    let tokens = h.login(BOB).await;

    h.directory
        .set_membership_status(h.bob, TENANT, MembershipStatus::Suspended);

    let result = h.refresh(&tokens.refresh_token).await;
    assert!(matches!(result, Err(AppError::AccountLocked)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_succeeds_once() {
    let h = TestHarness::new();
    let tokens = h.login(ALICE).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let authority = h.authority.clone();
        let refresh_token = tokens.refresh_token.clone();
        handles.push(tokio::spawn(async move {
            authority
                .issue_tokens(
                    tenant_guard::models::auth::GrantRequest::RefreshToken(
                        tenant_guard::models::auth::RefreshGrant { refresh_token },
                    ),
                    &client(),
                )
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert!(matches!(e, AppError::InvalidToken), "unexpected error: {e}"),
        }
    }

    assert_eq!(successes, 1);
    // 原会话对中只剩访问令牌，加上一对新会话
    assert_eq!(h.sessions.len(), 3);
}

#[tokio::test]
async fn test_store_failure_keeps_old_refresh_token_usable() {
    let h = TestHarness::new();
    let tokens = h.login(ALICE).await;

    h.sessions.set_unavailable(true);
    let result = h.refresh(&tokens.refresh_token).await;
    assert!(result.is_err());
    h.sessions.set_unavailable(false);

    let rotated = h.refresh(&tokens.refresh_token).await;
    assert!(rotated.is_ok());
}

#[tokio::test]
async fn test_login_fails_cleanly_when_store_unavailable() {
    let h = TestHarness::new();

    h.sessions.set_unavailable(true);
    let result = h.password_grant(ALICE, PASSWORD, TENANT).await;
    assert!(matches!(result, Err(AppError::Internal(_))));
    h.sessions.set_unavailable(false);

    assert!(h.sessions.is_empty());
}

// ==================== 吊销 ====================

#[tokio::test]
async fn test_revoke_access_token() {
    let h = TestHarness::new();
    let tokens = h.login(ALICE).await;

    let response = h
        .authority
        .revoke(&tokens.access_token, Some(SessionKind::Access), Some(h.alice), &client())
        .await
        .unwrap();
    assert!(response.revoked);

    let result = h.authority.introspect(&tokens.access_token).await;
    assert!(matches!(result, Err(AppError::InvalidToken)));

    // 幂等
    let again = h
        .authority
        .revoke(&tokens.access_token, None, None, &client())
        .await
        .unwrap();
    assert!(again.revoked);

    assert_eq!(h.audit_count(TENANT, "token.revoked"), 1);
}

#[tokio::test]
async fn test_revoke_refresh_token_blocks_rotation() {
    let h = TestHarness::new();
    let tokens = h.login(ALICE).await;

    h.authority
        .revoke(&tokens.refresh_token, Some(SessionKind::Refresh), None, &client())
        .await
        .unwrap();

    let result = h.refresh(&tokens.refresh_token).await;
    assert!(matches!(result, Err(AppError::InvalidToken)));
}

#[tokio::test]
async fn test_revoke_unknown_token_reports_success() {
    let h = TestHarness::new();

    let response = h
        .authority
        .revoke("never-issued", None, None, &client())
        .await
        .unwrap();
    assert!(response.revoked);
    assert!(h.audit_repo.entries(TENANT).is_empty());
}

#[tokio::test]
async fn test_revoke_by_other_user_has_no_effect() {
    let h = TestHarness::new();
    let alice = h.login(ALICE).await;

    let response = h
        .authority
        .revoke(&alice.access_token, None, Some(h.bob), &client())
        .await
        .unwrap();
    assert!(response.revoked);

    let claims = h.authority.introspect(&alice.access_token).await.unwrap();
    assert_eq!(claims.user_id, h.alice);
}

#[tokio::test]
async fn test_revoke_all_for_user() {
    let h = TestHarness::new();
    let first = h.login(ALICE).await;
    let second = h.login(ALICE).await;
    let bob = h.login(BOB).await;

    let count = h
        .authority
        .revoke_all_for_user(h.alice, Some(TENANT), &client())
        .await
        .unwrap();
    assert_eq!(count, 4);

    for token in [&first.access_token, &second.access_token] {
        assert!(matches!(
            h.authority.introspect(token).await,
            Err(AppError::InvalidToken)
        ));
    }
    assert!(matches!(
        h.refresh(&first.refresh_token).await,
        Err(AppError::InvalidToken)
    ));

    // 其他用户不受影响
    assert!(h.authority.introspect(&bob.access_token).await.is_ok());
    assert_eq!(h.audit_count(TENANT, "session.revoked_all"), 1);
}

// ==================== 内省 ====================

#[tokio::test]
async fn test_introspect_expired_access_token() {
    let h = TestHarness::new();
    let tokens = h.login(ALICE).await;

    h.clock.advance(Duration::seconds(901));
    let result = h.authority.introspect(&tokens.access_token).await;
    assert!(matches!(result, Err(AppError::InvalidToken)));
}

#[tokio::test]
async fn test_introspect_rejects_garbage() {
    let h = TestHarness::new();
    let result = h.authority.introspect("not-a-token").await;
    assert!(matches!(result, Err(AppError::InvalidToken)));
}

#[tokio::test]
async fn test_purge_expired_sessions() {
    let h = TestHarness::new();
    h.login(ALICE).await;

    // 访问令牌过期，刷新令牌仍有效
    h.clock.advance(Duration::seconds(901));
    assert_eq!(h.authority.purge_expired_sessions().await.unwrap(), 1);
    assert_eq!(h.sessions.len(), 1);
}

#[tokio::test]
async fn test_audit_chain_stays_intact_across_flows() {
    let h = TestHarness::new();
    let start = h.now() - Duration::hours(1);

    let tokens = h.login(ALICE).await;
    let _ = h.password_grant(ALICE, "wrong", TENANT).await;
    let rotated = h.refresh(&tokens.refresh_token).await.unwrap();
    h.authority
        .revoke(&rotated.access_token, None, None, &client())
        .await
        .unwrap();

    let result = h
        .audit
        .verify(TENANT, start, h.now() + Duration::hours(1))
        .await
        .unwrap();
    assert!(result.chain_intact);
    assert_eq!(result.entries_checked, 4);
}
