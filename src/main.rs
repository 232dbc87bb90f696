use axum::{
    Router,
    extract::{Form, State},
    response::Html,
    routing::{get, post},
};
use dotenv::dotenv;
use minijinja::{Environment, path_loader};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use live_restore::config::RestoreConfig;
use live_restore::database::backup::BackupManager;
use live_restore::database::config_store::ConfigStore;
use live_restore::database::drain::SqlitePoolSource;
use live_restore::database::gate::RestoreGate;
use live_restore::database::DATABASE_URL_KEY;
use live_restore::{BackupResult, RestoreExecutor, db};

// Define a struct to hold our application state
struct AppState {
    templates: Environment<'static>,
    pool: Arc<SqlitePoolSource>,
    executor: RestoreExecutor,
    backups: BackupManager,
    gate: RestoreGate,
}

fn render(templates: &Environment<'static>, name: &str, ctx: minijinja::Value) -> Html<String> {
    match templates.get_template(name).and_then(|t| t.render(ctx)) {
        Ok(rendered) => Html(rendered),
        Err(e) => {
            error!(template = name, error = %e, "template rendering failed");
            Html(String::from("Failed to render page"))
        }
    }
}

// Handler for the index route
async fn index_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    let active_database = match state.executor.active_database_path().await {
        Ok(path) => path.display().to_string(),
        Err(e) => e.to_string(),
    };
    let backups: Vec<String> = state
        .backups
        .list_backups()
        .await
        .unwrap_or_default()
        .iter()
        .map(|p| p.display().to_string())
        .collect();

    render(
        &state.templates,
        "index.html",
        minijinja::context! {
            active_database => active_database,
            backups => backups,
            restore_running => state.gate.is_busy(),
        },
    )
}

// Form data for a restore request
#[derive(Deserialize)]
struct RestoreForm {
    backup_path: String,
}

// Handler to restore the database from a snapshot
async fn restore_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<RestoreForm>,
) -> Html<String> {
    let result = run_restore(&state, &form.backup_path).await;
    render(&state.templates, "result.html", minijinja::context! { result => result })
}

// Handler to write a new snapshot
async fn backup_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    let result = state.backups.create_backup().await;
    render(&state.templates, "result.html", minijinja::context! { result => result })
}

/// Run one gated restore and move the shared pool onto the restored file
async fn run_restore(state: &AppState, backup_path: &str) -> BackupResult {
    let gated = state
        .gate
        .try_run(async {
            let result = state.executor.restore_database(backup_path).await;
            if result.is_success() {
                switch_pool(state).await;
            }
            result
        })
        .await;

    gated.unwrap_or_else(|| {
        BackupResult::failure("Another restore is already running; try again when it finishes.")
    })
}

async fn switch_pool(state: &AppState) {
    let path = match state.executor.active_database_path().await {
        Ok(path) => path,
        Err(e) => {
            warn!(error = %e, "could not resolve restored database path");
            return;
        }
    };

    match db::open_pool(&path).await {
        Ok(pool) => {
            let previous = state.pool.replace(pool);
            previous.close().await;
            info!(path = %path.display(), "switched to restored database");
        }
        Err(e) => error!(
            path = %path.display(),
            error = %e,
            "failed to open restored database, restart to pick it up"
        ),
    }
}

// Connection string from the config store wins over DATABASE_PATH
async fn initial_database_path(config: &RestoreConfig) -> PathBuf {
    let store = ConfigStore::new(&config.config_file);
    if store.exists().await {
        match store.get(DATABASE_URL_KEY).await {
            Ok(Some(url)) => {
                if let Some(path) = db::database_path_from_url(&url) {
                    return path;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read configuration store"),
        }
    }
    config.database_path.clone()
}

fn usage() -> ! {
    eprintln!("usage: live-restore [serve | backup | restore <backup-path>]");
    std::process::exit(2)
}

#[tokio::main]
async fn main() {
    // Load .env file
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RestoreConfig::from_env();
    if let Err(e) = config.ensure_local_backup_dir() {
        warn!(error = %e, "failed to create local backup directory");
    }

    // Set up the template environment
    let mut env = Environment::new();
    env.set_loader(path_loader("templates"));

    // Initialize the database
    let database_path = initial_database_path(&config).await;
    let pool = db::open_pool(&database_path)
        .await
        .expect("Failed to initialize database");
    info!(path = %database_path.display(), "database initialized");

    let source = Arc::new(SqlitePoolSource::new(pool));
    let state = Arc::new(AppState {
        templates: env,
        pool: source.clone(),
        executor: RestoreExecutor::from_config(&config, source.clone()),
        backups: BackupManager::new(source, config.local_backup_dir.clone()),
        gate: RestoreGate::new(),
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        None | Some("serve") => None,
        Some("backup") => Some(state.backups.create_backup().await),
        Some("restore") => match args.get(1) {
            Some(path) => Some(run_restore(&state, path).await),
            None => usage(),
        },
        Some(_) => usage(),
    };

    if let Some(result) = result {
        println!("{}", result);
        state.pool.pool().close().await;
        std::process::exit(if result.is_success() { 0 } else { 1 });
    }

    // Set up the routes
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/backup", post(backup_handler))
        .route("/restore", post(restore_handler))
        .with_state(state);

    info!(addr = %config.listen_addr, "server starting");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind listen address");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server stopped");
    }
}
