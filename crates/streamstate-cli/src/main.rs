use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use streamstate::{Publisher, SetOptions, Subscriber, message_callback, normalize_channel};
use streamstate_postgres::{
    PostgresConfig, PostgresStoreClient, TableName, create_adapters,
    spawn_expiry_reaper,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "streamstate")]
#[command(about = "Operate the Postgres-backed stream state table and notification channels")]
struct Cli {
    /// Overrides STREAMSTATE_POSTGRES_URL / DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Table name, optionally schema-qualified. Overrides STREAMSTATE_TABLE.
    #[arg(long, global = true)]
    table: Option<TableName>,
    /// Default filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the identifier a channel name maps to.
    Normalize(ChannelArgs),
    #[command(flatten)]
    Store(StoreCommand),
}

/// Commands that need a database connection.
#[derive(Subcommand, Debug)]
enum StoreCommand {
    /// Create the backing table if it does not exist.
    InitSchema,
    Set(SetArgs),
    Get(KeyArgs),
    Incr(KeyArgs),
    Publish(PublishArgs),
    /// Print messages from a channel until interrupted.
    Subscribe(ChannelArgs),
    /// Delete rows whose expiry has passed.
    PurgeExpired,
}

#[derive(clap::Args, Debug)]
struct SetArgs {
    key: String,
    value: String,
    #[arg(long)]
    expire_seconds: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    key: String,
}

#[derive(clap::Args, Debug)]
struct PublishArgs {
    channel: String,
    message: String,
}

#[derive(clap::Args, Debug)]
struct ChannelArgs {
    channel: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let result = match cli.command {
        Commands::Normalize(args) => {
            println!("{}", normalize_channel(&args.channel));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Store(command) => match resolve_config(cli.database_url, cli.table) {
            Ok(config) => run_command(command, config).await,
            Err(error) => Err(error),
        },
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("streamstate={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn resolve_config(
    database_url: Option<String>,
    table: Option<TableName>,
) -> Result<PostgresConfig, String> {
    let mut config = PostgresConfig::from_env().map_err(|error| error.to_string())?;
    if let Some(url) = database_url {
        config.url = url;
    }
    if let Some(table) = table {
        config = config.with_table(table);
    }
    Ok(config)
}

async fn run_command(command: StoreCommand, config: PostgresConfig) -> Result<ExitCode, String> {
    let client = Arc::new(
        PostgresStoreClient::connect_with_config(&config)
            .await
            .map_err(|error| error.to_string())?,
    );
    let (publisher, subscriber) = create_adapters(Arc::clone(&client), config.table.clone());

    match command {
        StoreCommand::InitSchema => {
            client
                .create_table_if_missing(&config.table)
                .await
                .map_err(|error| error.to_string())?;
            info!(table = %config.table, "schema ready");
            Ok(ExitCode::SUCCESS)
        }
        StoreCommand::Set(args) => {
            let options = SetOptions {
                expire_seconds: args.expire_seconds,
            };
            publisher
                .set(&args.key, &args.value, options)
                .await
                .map_err(|error| error.to_string())?;
            Ok(ExitCode::SUCCESS)
        }
        StoreCommand::Get(args) => match publisher
            .get(&args.key)
            .await
            .map_err(|error| error.to_string())?
        {
            Some(value) => {
                println!("{value}");
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("{}: not found", args.key);
                Ok(ExitCode::from(1))
            }
        },
        StoreCommand::Incr(args) => {
            let value = publisher
                .incr(&args.key)
                .await
                .map_err(|error| error.to_string())?;
            println!("{value}");
            Ok(ExitCode::SUCCESS)
        }
        StoreCommand::Publish(args) => {
            let receivers = publisher
                .publish(&args.channel, &args.message)
                .await
                .map_err(|error| error.to_string())?;
            println!("{receivers}");
            Ok(ExitCode::SUCCESS)
        }
        StoreCommand::Subscribe(args) => {
            subscribe_until_interrupted(&client, subscriber, &config, &args.channel).await
        }
        StoreCommand::PurgeExpired => {
            let deleted = publisher
                .purge_expired()
                .await
                .map_err(|error| error.to_string())?;
            println!("{deleted}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn subscribe_until_interrupted(
    client: &Arc<PostgresStoreClient>,
    subscriber: impl Subscriber,
    config: &PostgresConfig,
    channel: &str,
) -> Result<ExitCode, String> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    subscriber
        .subscribe(
            channel,
            message_callback(move |payload| {
                let _ = sender.send(payload);
            }),
        )
        .await
        .map_err(|error| error.to_string())?;

    let reaper = config.reap_interval.map(|interval| {
        spawn_expiry_reaper(Arc::clone(client), config.table.clone(), interval)
    });
    info!(channel, hashed_channel = %normalize_channel(channel), "subscribed; ctrl-c to stop");

    let outcome = loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(payload) => println!("{payload}"),
                None => break Err("subscription closed".to_string()),
            },
            signal = tokio::signal::ctrl_c() => {
                break signal.map(|()| ExitCode::SUCCESS).map_err(|error| error.to_string());
            }
        }
    };

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    subscriber
        .unsubscribe(channel)
        .await
        .map_err(|error| error.to_string())?;
    outcome
}
