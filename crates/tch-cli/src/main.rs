use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tch_schemas::Handler;

mod commands;

#[derive(Parser)]
#[command(name = "tch")]
#[command(about = "Order conversion desk CLI", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base -> env overlay)
    #[arg(long = "config", global = true)]
    config_paths: Vec<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Server database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List the intent orders visible to a handler
    Intents {
        #[arg(long)]
        handler_id: i64,
    },

    /// List formal orders, newest first
    Formal,

    /// Save target fields on an intent order; with --confirm, lock it as CONFIRMED
    Lock {
        #[arg(long)]
        order_id: i64,

        #[arg(long)]
        handler_id: i64,

        #[arg(long)]
        gift: Option<String>,

        #[arg(long, default_value_t = 0)]
        qty: i64,

        /// Delivery date, free text (e.g. 2026-11-01)
        #[arg(long)]
        delivery_date: Option<String>,

        #[arg(long)]
        contact_method: Option<String>,

        /// Lock the order instead of saving a draft
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },

    /// Convert a confirmed order: render, checkpoint, upload, finalize
    Convert {
        #[arg(long)]
        order_id: i64,

        #[command(flatten)]
        handler: HandlerArgs,
    },

    /// Resume every queued conversion, oldest first
    Resume {
        #[command(flatten)]
        handler: HandlerArgs,
    },

    /// Local retry queue utilities
    Queue {
        #[command(subcommand)]
        cmd: QueueCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Apply SQL migrations to the server database.
    Migrate,
}

#[derive(Subcommand)]
enum QueueCmd {
    /// Print every pending entry, oldest first
    List,

    /// Drop a stuck entry. The snapshot file is left on disk.
    Discard {
        #[arg(long)]
        order_id: i64,

        /// Acknowledge that the order will have to be re-rendered.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(clap::Args)]
struct HandlerArgs {
    #[arg(long)]
    handler_id: i64,

    #[arg(long)]
    handler_name: String,
}

impl HandlerArgs {
    fn handler(&self) -> Handler {
        Handler::new(self.handler_id, self.handler_name.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    if let Commands::ConfigHash { paths } = &cli.cmd {
        let loaded = tch_config::load_layered_yaml(paths)?;
        println!("config_hash={}", loaded.config_hash);
        println!("{}", loaded.canonical_json);
        return Ok(());
    }

    let cfg = tch_config::load_desk_config(&cli.config_paths)?;
    init_tracing(&cfg.logging.filter);

    match cli.cmd {
        Commands::ConfigHash { .. } => {}

        Commands::Db { cmd } => match cmd {
            DbCmd::Migrate => {
                let pool = tch_db::connect(&cfg.daemon.db_url).await?;
                tch_db::migrate(&pool).await?;
                println!("migrations_applied=true");
            }
        },

        Commands::Intents { handler_id } => commands::orders::intents(&cfg, handler_id).await?,
        Commands::Formal => commands::orders::formal(&cfg).await?,

        Commands::Lock {
            order_id,
            handler_id,
            gift,
            qty,
            delivery_date,
            contact_method,
            confirm,
        } => {
            let req = tch_schemas::LockIntentRequest {
                order_id,
                target: tch_schemas::TargetFields {
                    gift_name: gift,
                    qty,
                    delivery_date,
                },
                contact_method,
                confirm,
                handler_id,
            };
            commands::orders::lock(&cfg, &req).await?;
        }

        Commands::Convert { order_id, handler } => {
            commands::convert::convert(&cfg, order_id, &handler.handler()).await?
        }
        Commands::Resume { handler } => commands::convert::resume(&cfg, &handler.handler()).await?,

        Commands::Queue { cmd } => match cmd {
            QueueCmd::List => commands::queue::list(&cfg).await?,
            QueueCmd::Discard { order_id, yes } => {
                commands::queue::discard(&cfg, order_id, yes).await?
            }
        },
    }

    Ok(())
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}
