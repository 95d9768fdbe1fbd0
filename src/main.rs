//! backupmanager
//!
//! CLI for managing connections, destinations and schedules, running one-off
//! backups and restores, and serving the scheduler.

use anyhow::{Context, Result};
use backupmanager::backup::snapshot::snapshot_time;
use backupmanager::backup::{BackupManager, EngineSettings, SourceDatabase};
use backupmanager::config::AppConfig;
use backupmanager::models::{
    Connection, ConnectionPatch, DestinationPatch, NewConnection, NewDestination, ScheduleFilter,
};
use backupmanager::scheduler::{EngineRunner, ScheduleRegistry, Scheduler};
use backupmanager::storage::{BackupTarget, S3Storage};
use backupmanager::store::{PgStore, Store};
use backupmanager::utils::logging;
use backupmanager::utils::setting::check_db_connection;
use backupmanager::vault::Vault;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "backupmanager", version, about = "PostgreSQL backup orchestration and scheduling")]
struct Cli {
    /// Optional JSON config file; environment variables override it.
    #[arg(long, global = true, env = "BACKUPMANAGER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted.
    Serve,
    /// Take a backup now. Without --destination it stays on local disk.
    Backup {
        #[arg(long)]
        connection: i64,
        #[arg(long)]
        destination: Option<i64>,
    },
    /// Restore a snapshot into the connection's database.
    Restore {
        #[arg(long)]
        connection: i64,
        #[arg(long)]
        destination: Option<i64>,
        file: String,
    },
    /// List snapshots for a connection.
    List {
        #[arg(long)]
        connection: i64,
        #[arg(long)]
        destination: Option<i64>,
    },
    /// Delete one snapshot.
    Delete {
        #[arg(long)]
        connection: i64,
        #[arg(long)]
        destination: Option<i64>,
        file: String,
    },
    /// Probe an object-store destination.
    TestDestination { id: i64 },
    #[command(subcommand)]
    Connection(ConnectionCommand),
    #[command(subcommand)]
    Destination(DestinationCommand),
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Hash a password (read from stdin when not given).
    HashPassword {
        #[arg(long, env = "BACKUPMANAGER_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Check a password (read from stdin when not given) against a hash.
    VerifyPassword {
        hash: String,
        #[arg(long, env = "BACKUPMANAGER_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConnectionCommand {
    Add {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 5432)]
        port: i32,
        #[arg(long)]
        db: String,
        #[arg(long)]
        user: String,
        #[arg(long, env = "BACKUP_DB_PASSWORD", hide_env_values = true)]
        password: String,
        /// Connect with the given credentials before saving them.
        #[arg(long)]
        test: bool,
    },
    /// Change the given fields; the password is re-encrypted when given.
    Update {
        id: i64,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<i32>,
        #[arg(long)]
        db: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, env = "BACKUP_DB_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Open and close a connection with the stored credentials.
    Test { id: i64 },
    List,
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum DestinationCommand {
    Add {
        #[arg(long)]
        connection: i64,
        #[arg(long)]
        name: String,
        /// Leave empty for AWS S3 itself.
        #[arg(long, default_value = "")]
        endpoint: String,
        #[arg(long, default_value = "")]
        region: String,
        #[arg(long)]
        bucket: String,
        #[arg(long, env = "BACKUP_S3_ACCESS_KEY_ID", hide_env_values = true)]
        access_key_id: String,
        #[arg(long, env = "BACKUP_S3_SECRET_ACCESS_KEY", hide_env_values = true)]
        secret_access_key: String,
        #[arg(long, default_value = "")]
        path_prefix: String,
        /// Use plain http when the endpoint has no scheme.
        #[arg(long)]
        no_ssl: bool,
        #[arg(long)]
        insecure: bool,
        /// Create the bucket when it does not exist yet.
        #[arg(long)]
        create_bucket: bool,
    },
    /// Change the given fields; credentials are re-encrypted when given.
    Update {
        id: i64,
        #[arg(long)]
        connection: Option<i64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long, env = "BACKUP_S3_ACCESS_KEY_ID", hide_env_values = true)]
        access_key_id: Option<String>,
        #[arg(long, env = "BACKUP_S3_SECRET_ACCESS_KEY", hide_env_values = true)]
        secret_access_key: Option<String>,
        #[arg(long)]
        path_prefix: Option<String>,
        #[arg(long)]
        use_ssl: Option<bool>,
        #[arg(long)]
        verify_ssl: Option<bool>,
    },
    List {
        #[arg(long)]
        connection: Option<i64>,
    },
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    Create {
        #[arg(long)]
        connection: i64,
        #[arg(long)]
        destination: i64,
        /// e.g. "0 3 * * *" or "@daily"
        expression: String,
    },
    /// Patch fields given as a JSON object, e.g. '{"enabled": false}'.
    Update { id: i64, fields: String },
    Delete { id: i64 },
    Enable { id: i64 },
    Disable { id: i64 },
    List {
        #[arg(long)]
        connection: Option<i64>,
        #[arg(long)]
        destination: Option<i64>,
        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Enabled schedules and the next run a serving scheduler stored for them.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load application configuration")?;
    logging::init(config.log_format);
    let vault = Arc::new(Vault::new(&config.secret_key)?);

    match cli.command {
        Command::HashPassword { password } => {
            let password = read_secret(password, "Password: ")?;
            println!("{}", vault.hash_password(&password)?);
        }
        Command::VerifyPassword { hash, password } => {
            let password = read_secret(password, "Password: ")?;
            vault.validate_password(&password, &hash)?;
            println!("Password is valid.");
        }
        Command::Serve => serve(&config, vault).await?,
        Command::TestDestination { id } => {
            let store = open_store(&config).await?;
            let destination = store.get_destination(id).await?;
            let reachable = BackupManager::test_destination(&destination, &vault, config.timeouts).await;
            println!("{}: {}", destination.name, if reachable { "reachable" } else { "unreachable" });
            if !reachable {
                anyhow::bail!("Destination {} is not reachable", destination.name);
            }
        }
        Command::Backup { connection, destination } => {
            let (manager, target) = engine_for(&config, &vault, connection, destination).await?;
            let name = manager.create_backup(&target).await.context("Backup failed")?;
            println!("{}", name);
        }
        Command::Restore { connection, destination, file } => {
            let (manager, target) = engine_for(&config, &vault, connection, destination).await?;
            manager.restore_from_backup(&target, &file).await.context("Restore failed")?;
            println!("Restored {} into {}", file, manager.source().label());
        }
        Command::List { connection, destination } => {
            let (manager, target) = engine_for(&config, &vault, connection, destination).await?;
            for name in manager.list_available_backups(&target).await {
                match snapshot_time(&name) {
                    Some(taken_at) => println!("{}\t{}", name, taken_at.to_rfc3339()),
                    None => println!("{}", name),
                }
            }
        }
        Command::Delete { connection, destination, file } => {
            let (manager, target) = engine_for(&config, &vault, connection, destination).await?;
            manager.delete_backup(&target, &file).await?;
            println!("Deleted {}", file);
        }
        Command::Connection(action) => connection_command(&config, &vault, action).await?,
        Command::Destination(action) => destination_command(&config, &vault, action).await?,
        Command::Schedule(action) => schedule_command(&config, action).await?,
    }
    Ok(())
}

async fn serve(config: &AppConfig, vault: Arc<Vault>) -> Result<()> {
    let store = open_store(config).await?;
    let settings = Arc::new(EngineSettings::from_config(config)?);
    let runner = Arc::new(EngineRunner::new(store.clone(), settings, vault));
    let scheduler = Arc::new(Scheduler::new(store.clone(), runner));

    // Subscribe before loading so no edit falls between the two.
    let feed = store
        .schedule_changes()
        .await
        .context("Failed to listen for schedule changes")?;
    scheduler.start().await.context("Failed to start scheduler")?;
    let follower = scheduler.follow_changes(feed);
    info!("Scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    follower.abort();
    scheduler.stop().await;
    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn Store>> {
    let store = PgStore::connect(config.require_database_url()?, config.timeouts.db_connect).await?;
    store.migrate().await.context("Failed to prepare metadata schema")?;
    Ok(Arc::new(store))
}

async fn engine_for(
    config: &AppConfig,
    vault: &Arc<Vault>,
    connection_id: i64,
    destination_id: Option<i64>,
) -> Result<(BackupManager, BackupTarget)> {
    let store = open_store(config).await?;
    let connection = store.get_connection(connection_id).await?;
    let target = match destination_id {
        Some(id) => BackupTarget::ObjectStore(store.get_destination(id).await?),
        None => BackupTarget::Local,
    };
    let settings = Arc::new(EngineSettings::from_config(config)?);
    let source = SourceDatabase::from_connection(&connection, vault)?;
    Ok((BackupManager::new(source, settings, vault.clone()), target))
}

async fn connection_command(config: &AppConfig, vault: &Vault, action: ConnectionCommand) -> Result<()> {
    let store = open_store(config).await?;
    match action {
        ConnectionCommand::Add {
            host,
            port,
            db,
            user,
            password,
            test,
        } => {
            if test {
                let port = u16::try_from(port).context("Port is out of range")?;
                let source = SourceDatabase::new(&host, port, &db, &user, Zeroizing::new(password.clone()));
                check_db_connection(&source.connect_options(), &source.label(), config.timeouts.db_connect).await?;
            }
            let connection = store
                .insert_connection(NewConnection {
                    host,
                    port,
                    db_name: db,
                    username: user,
                    encrypted_password: vault.encrypt_string(&password)?,
                })
                .await?;
            print_json(&connection)?;
        }
        ConnectionCommand::Update {
            id,
            host,
            port,
            db,
            user,
            password,
        } => {
            let patch = ConnectionPatch {
                host,
                port,
                db_name: db,
                username: user,
                encrypted_password: password.map(|p| vault.encrypt_string(&p)).transpose()?,
            };
            if patch.is_empty() {
                anyhow::bail!("Nothing to update");
            }
            print_json(&store.update_connection(id, &patch).await?)?;
        }
        ConnectionCommand::Test { id } => {
            let connection = store.get_connection(id).await?;
            let source = SourceDatabase::from_connection(&connection, vault)?;
            check_db_connection(&source.connect_options(), &source.label(), config.timeouts.db_connect).await?;
            println!("{}: reachable", source.label());
        }
        ConnectionCommand::List => {
            let connections: Vec<Connection> = store.list_connections().await?;
            print_json(&connections)?;
        }
        ConnectionCommand::Remove { id } => {
            store.delete_connection(id).await?;
            println!("Removed connection {}", id);
        }
    }
    Ok(())
}

async fn destination_command(config: &AppConfig, vault: &Vault, action: DestinationCommand) -> Result<()> {
    let store = open_store(config).await?;
    match action {
        DestinationCommand::Add {
            connection,
            name,
            endpoint,
            region,
            bucket,
            access_key_id,
            secret_access_key,
            path_prefix,
            no_ssl,
            insecure,
            create_bucket,
        } => {
            store.get_connection(connection).await?;
            let destination = store
                .insert_destination(NewDestination {
                    connection_id: connection,
                    name,
                    endpoint_url: endpoint,
                    region,
                    bucket_name: bucket,
                    encrypted_access_key_id: vault.encrypt_string(&access_key_id)?,
                    encrypted_secret_access_key: vault.encrypt_string(&secret_access_key)?,
                    path_prefix,
                    use_ssl: !no_ssl,
                    verify_ssl: !insecure,
                })
                .await?;

            if create_bucket {
                let backend = S3Storage::from_destination(&destination, vault, config.timeouts).await?;
                if !backend.bucket_exists().await? {
                    backend.create_bucket().await?;
                }
            }
            print_json(&destination)?;
        }
        DestinationCommand::Update {
            id,
            connection,
            name,
            endpoint,
            region,
            bucket,
            access_key_id,
            secret_access_key,
            path_prefix,
            use_ssl,
            verify_ssl,
        } => {
            let patch = DestinationPatch {
                connection_id: connection,
                name,
                endpoint_url: endpoint,
                region,
                bucket_name: bucket,
                encrypted_access_key_id: access_key_id.map(|k| vault.encrypt_string(&k)).transpose()?,
                encrypted_secret_access_key: secret_access_key.map(|k| vault.encrypt_string(&k)).transpose()?,
                path_prefix,
                use_ssl,
                verify_ssl,
            };
            if patch.is_empty() {
                anyhow::bail!("Nothing to update");
            }
            print_json(&store.update_destination(id, &patch).await?)?;
        }
        DestinationCommand::List { connection } => print_json(&store.list_destinations(connection).await?)?,
        DestinationCommand::Remove { id } => {
            store.delete_destination(id).await?;
            println!("Removed destination {}", id);
        }
    }
    Ok(())
}

// Mutations reach a running `serve` through the store's change feed.
async fn schedule_command(config: &AppConfig, action: ScheduleCommand) -> Result<()> {
    let store = open_store(config).await?;
    let registry = ScheduleRegistry::detached(store);

    match action {
        ScheduleCommand::Create { connection, destination, expression } => {
            print_json(&registry.create(connection, destination, &expression).await?)?;
        }
        ScheduleCommand::Update { id, fields } => {
            let fields: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&fields).context("Schedule fields must be a JSON object")?;
            print_json(&registry.update(id, &fields).await?)?;
        }
        ScheduleCommand::Delete { id } => {
            registry.delete(id).await?;
            println!("Deleted schedule {}", id);
        }
        ScheduleCommand::Enable { id } => print_json(&registry.enable(id).await?)?,
        ScheduleCommand::Disable { id } => print_json(&registry.disable(id).await?)?,
        ScheduleCommand::List { connection, destination, enabled } => {
            let filter = ScheduleFilter {
                connection_id: connection,
                destination_id: destination,
                enabled,
            };
            print_json(&registry.list(&filter).await?)?;
        }
        ScheduleCommand::Status => print_json(&registry.armed().await?)?,
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_secret(given: Option<String>, prompt: &str) -> Result<String> {
    use std::io::{Write, stderr, stdin};

    if let Some(value) = given {
        return Ok(value);
    }
    eprint!("{}", prompt);
    stderr().flush().context("Failed to flush stderr")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read from stdin")?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}
