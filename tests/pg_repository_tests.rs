//! PostgreSQL 仓储集成测试
//!
//! 需要可用的数据库：TEST_DATABASE_URL=... cargo test -- --ignored

use chrono::{Duration, DurationRound, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tenant_guard::{
    clock::{Clock, SystemClock},
    db,
    models::{
        audit::{AuditEvent, AuditEventType},
        directory::MembershipStatus,
        session::{Session, SessionKind, SessionPair},
    },
    repository::{
        AuditRepository, Directory, PgAuditRepository, PgDirectory, PgSessionRepository,
        SessionRepository,
    },
    services::AuditService,
};
use uuid::Uuid;

mod common;

async fn setup_test_db() -> PgPool {
    let config = common::create_test_config();
    let pool = db::create_pool(&config.database)
        .await
        .expect("Failed to create test database pool");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

fn session(user_id: Uuid, kind: SessionKind, ttl: Duration) -> Session {
    // PostgreSQL 只保存到微秒
    let now = Utc::now()
        .duration_trunc(Duration::microseconds(1))
        .unwrap();
    Session {
        id: Uuid::new_v4(),
        user_id,
        tenant_id: Some("pg-test".to_string()),
        kind,
        token_hash: format!("{:x}", Uuid::new_v4().as_u128()),
        expires_at: now + ttl,
        ip_address: Some("127.0.0.1".to_string()),
        user_agent: None,
        created_at: now,
    }
}

#[tokio::test]
#[ignore]
async fn test_session_pair_lifecycle() {
    let pool = setup_test_db().await;
    let repo = PgSessionRepository::new(pool);
    let user_id = Uuid::new_v4();

    let pair = SessionPair {
        access: session(user_id, SessionKind::Access, Duration::minutes(15)),
        refresh: session(user_id, SessionKind::Refresh, Duration::days(7)),
    };
    repo.create_pair(&pair).await.unwrap();

    let found = repo
        .find_active_by_token_hash(&pair.refresh.token_hash, Utc::now())
        .await
        .unwrap()
        .expect("refresh session stored");
    assert_eq!(found.id, pair.refresh.id);
    assert_eq!(found.kind, SessionKind::Refresh);

    // 只有第一次删除成功
    assert!(repo.delete_by_token_hash(&pair.refresh.token_hash).await.unwrap());
    assert!(!repo.delete_by_token_hash(&pair.refresh.token_hash).await.unwrap());

    let deleted = repo.delete_all_for_user(user_id).await.unwrap();
    assert_eq!(deleted, vec![pair.access.token_hash.clone()]);
}

#[tokio::test]
#[ignore]
async fn test_create_pair_is_atomic() {
    let pool = setup_test_db().await;
    let repo = PgSessionRepository::new(pool);
    let user_id = Uuid::new_v4();

    let existing = session(user_id, SessionKind::Access, Duration::minutes(15));
    repo.create(&existing).await.unwrap();

    // 刷新会话与已有令牌哈希冲突，访问会话也不应写入
    let mut refresh = session(user_id, SessionKind::Refresh, Duration::days(7));
    refresh.token_hash = existing.token_hash.clone();
    let access = session(user_id, SessionKind::Access, Duration::minutes(15));
    let result = repo
        .create_pair(&SessionPair {
            access: access.clone(),
            refresh,
        })
        .await;
    assert!(result.is_err());

    let found = repo
        .find_active_by_token_hash(&access.token_hash, Utc::now())
        .await
        .unwrap();
    assert!(found.is_none());

    repo.delete_all_for_user(user_id).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_audit_chain_in_postgres() {
    let pool = setup_test_db().await;
    let repo = Arc::new(PgAuditRepository::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = AuditService::new(repo.clone(), clock.clone());

    // 每次运行使用新租户，审计表不可删除
    let tenant = format!("pg-audit-{}", Uuid::new_v4());
    let start = clock.now() - Duration::seconds(1);

    let mut entries = Vec::new();
    for i in 0..3 {
        let entry = service
            .append(
                &tenant,
                AuditEvent::new(AuditEventType::LoginSuccess, "login")
                    .user(Some(Uuid::new_v4()), format!("user-{}", i))
                    .details(serde_json::json!({ "n": i, "tags": ["a", "b"] })),
            )
            .await
            .unwrap();
        entries.push(entry);
    }

    let result = service
        .verify(&tenant, start, clock.now() + Duration::seconds(1))
        .await
        .unwrap();
    assert!(result.chain_intact);
    assert_eq!(result.entries_checked, 3);

    let third = repo.by_sequence(&tenant, 3).await.unwrap().unwrap();
    assert_eq!(third.id, entries[2].id);
    assert_eq!(third.hash, entries[2].hash);
    assert!(repo.by_sequence(&tenant, 4).await.unwrap().is_none());

    // 同一序号不能写两次
    let duplicate = sqlx::query(
        "INSERT INTO audit_logs (id, tenant_id, sequence, event_type, category, action, \
         timestamp, hash, previous_hash) \
         SELECT $1, tenant_id, sequence, event_type, category, action, timestamp, hash, previous_hash \
         FROM audit_logs WHERE tenant_id = $2 AND sequence = 3",
    )
    .bind(Uuid::new_v4())
    .bind(&tenant)
    .execute(&pool)
    .await;
    assert!(duplicate.is_err());

    // 审计表只允许追加
    let update = sqlx::query("UPDATE audit_logs SET action = 'forged' WHERE tenant_id = $1")
        .bind(&tenant)
        .execute(&pool)
        .await;
    assert!(update.is_err());
}

#[tokio::test]
#[ignore]
async fn test_audit_appends_from_two_instances() {
    let pool = setup_test_db().await;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    // 两个实例各自的进程内锁互不可见，只能依靠数据库串行化
    let first = Arc::new(AuditService::new(
        Arc::new(PgAuditRepository::new(pool.clone())),
        clock.clone(),
    ));
    let second = Arc::new(AuditService::new(
        Arc::new(PgAuditRepository::new(pool.clone())),
        clock.clone(),
    ));

    let tenant = format!("pg-audit-{}", Uuid::new_v4());
    let start = clock.now() - Duration::seconds(1);

    let mut handles = Vec::new();
    for i in 0..20 {
        for service in [first.clone(), second.clone()] {
            let tenant = tenant.clone();
            handles.push(tokio::spawn(async move {
                service
                    .append(
                        &tenant,
                        AuditEvent::new(AuditEventType::LoginFailure, "login")
                            .details(serde_json::json!({ "n": i })),
                    )
                    .await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let result = first
        .verify(&tenant, start, clock.now() + Duration::seconds(1))
        .await
        .unwrap();
    assert!(result.chain_intact);
    assert_eq!(result.entries_checked, 40);
}

#[tokio::test]
#[ignore]
async fn test_directory_lookups() {
    let pool = setup_test_db().await;
    let directory = PgDirectory::new(pool.clone());

    let tenant_id = format!("pg-dir-{}", Uuid::new_v4());
    let user_id = Uuid::new_v4();
    let username = format!("user-{}", user_id);

    sqlx::query("INSERT INTO tenants (id, name, status) VALUES ($1, $2, 'active')")
        .bind(&tenant_id)
        .bind("PG Tenant")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO users (id, username) VALUES ($1, $2)")
        .bind(user_id)
        .bind(&username)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO tenant_memberships (user_id, tenant_id, status, roles, permissions) \
         VALUES ($1, $2, 'password_expired', $3, $4)",
    )
    .bind(user_id)
    .bind(&tenant_id)
    .bind(vec!["auditor".to_string()])
    .bind(vec!["audit:read".to_string(), "audit:verify".to_string()])
    .execute(&pool)
    .await
    .unwrap();

    let tenant = directory.find_tenant(&tenant_id).await.unwrap().unwrap();
    assert!(tenant.is_active());

    let user = directory
        .find_user_by_username(&username)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.id, user_id);
    assert!(!user.mfa_enabled);

    let membership = directory
        .find_membership(user_id, &tenant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(membership.status, MembershipStatus::PasswordExpired);
    assert_eq!(membership.permissions.len(), 2);

    directory
        .record_login(user_id, Utc::now(), Some("203.0.113.5"))
        .await
        .unwrap();
    let user = directory.find_user(user_id).await.unwrap().unwrap();
    assert_eq!(user.last_login_ip.as_deref(), Some("203.0.113.5"));
}
