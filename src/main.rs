//! 安全核心服务主入口

use std::sync::Arc;
use std::time::Duration;
use tenant_guard::{
    cache::{KvCache, MemoryCache},
    clock::{Clock, SystemClock},
    config::AppConfig,
    db,
    handlers::health,
    middleware::AppState,
    repository::{PgAuditRepository, PgDirectory, PgSessionRepository},
    routes,
    services::{AuditService, AuthorityDeps, TokenAuthority},
    telemetry,
};
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("tenant-guard {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 按优先级加载：.env.{GUARD_ENV} 或 .env.local > .env
    // 生产环境应该直接设置环境变量
    if let Ok(env) = std::env::var("GUARD_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    health::set_start_time();

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志
    telemetry::init_telemetry(&config);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Tenant guard starting...");

    // 3. 数据库连接池 + 迁移
    let db_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&db_pool).await?;

    tracing::info!("Database initialized");

    // 4. 缓存与服务
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let memory_cache = Arc::new(MemoryCache::new(clock.clone()));
    let cache = build_cache(&config, memory_cache.clone()).await?;

    let audit_service = Arc::new(AuditService::new(
        Arc::new(PgAuditRepository::new(db_pool.clone())),
        clock.clone(),
    ));

    let token_authority = Arc::new(TokenAuthority::new(
        AuthorityDeps {
            directory: Arc::new(PgDirectory::new(db_pool.clone())),
            sessions: Arc::new(PgSessionRepository::new(db_pool.clone())),
            cache,
            audit: audit_service.clone(),
            clock,
        },
        &config.security,
    )?);

    spawn_sweeper(
        token_authority.clone(),
        memory_cache,
        Duration::from_secs(config.server.sweep_interval_secs.max(1)),
    );

    let config = Arc::new(config);
    let app_state = AppState {
        config: config.clone(),
        db: Some(db_pool.clone()),
        token_authority,
        audit_service,
    };

    // 5. 构建路由
    let app = routes::create_router(app_state);

    // 6. 启动服务器
    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    // 7. 优雅关闭
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.graceful_shutdown_timeout_secs))
        .await?;

    db_pool.close().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 根据配置选择缓存后端
async fn build_cache(
    config: &AppConfig,
    memory_cache: Arc<MemoryCache>,
) -> anyhow::Result<Arc<dyn KvCache>> {
    match config.cache.backend.to_lowercase().as_str() {
        #[cfg(feature = "redis")]
        "redis" => {
            use secrecy::ExposeSecret;
            let url = config
                .cache
                .redis_url
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("cache.redis_url is required for redis backend"))?;
            let cache = tenant_guard::cache::RedisCache::connect(
                url.expose_secret(),
                config.cache.key_prefix.clone(),
            )
            .await?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "redis"))]
        "redis" => Err(anyhow::anyhow!(
            "cache.backend = redis requires building with the `redis` feature"
        )),
        _ => {
            tracing::info!("Using in-process cache");
            Ok(memory_cache)
        }
    }
}

/// 周期性清理过期会话和内存缓存条目
fn spawn_sweeper(
    token_authority: Arc<TokenAuthority>,
    memory_cache: Arc<MemoryCache>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match token_authority.purge_expired_sessions().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "Expired sessions purged"),
                Err(e) => tracing::warn!(error = %e, "Session sweep failed"),
            }

            let evicted = memory_cache.purge_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "Expired cache entries evicted");
            }
        }
    });
}

/// 优雅关闭信号处理
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }

    // 超时后强制退出
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        std::process::exit(1);
    });
}

/// 打印帮助信息
fn print_help() {
    println!("tenant-guard {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: tenant-guard [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 GUARD_ 前缀的环境变量完成，例如");
    println!("  GUARD_DATABASE__URL, GUARD_SECURITY__ACCESS_TOKEN_EXP_SECS");
    println!("  可用选项请参考 .env.example");
}
