use anyhow::Result;
use clap::{Parser, Subcommand};
use relaygate_backend::config::RelayConfig;
use relaygate_backend::node::RelayNode;
use relaygate_backend::telemetry;
use relaygate_backend::utils;

#[derive(Parser)]
#[command(author, version, about = "Private-message relay into per-user group threads")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (webhook, verification callback, admin API)
    Serve,
    /// Print global toggles and the quota breaker state
    Status {
        /// Also show what is stored for this user
        user_id: Option<i64>,
    },
    /// Drop every future message from a user
    Ban { user_id: i64 },
    Unban { user_id: i64 },
    /// Let a user skip verification and spam checks
    Trust { user_id: i64 },
    Untrust { user_id: i64 },
    /// Forget a user's thread, verification and queue
    WipeUser { user_id: i64 },
    /// Delete all relay state except bans, trust marks and settings
    WipeAll {
        #[arg(long)]
        yes: bool,
    },
    /// Change a global setting (bot_enabled, spam_enabled, verify_provider, spam_rules)
    Set { key: String, value: String },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let args = Args::parse();

    let config = RelayConfig::from_env()?;
    let node = RelayNode::start(config).await?;
    tracing::info!(app = utils::APP_NAME, version = env!("CARGO_PKG_VERSION"), "bootstrap complete");
    let admin = &node.services().admin;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => node.run_http_server().await,
        Command::Status { user_id } => {
            print_json(&admin.overview().await?)?;
            if let Some(user_id) = user_id {
                print_json(&admin.status(user_id).await?)?;
            }
            Ok(())
        }
        Command::Ban { user_id } => Ok(admin.ban(user_id).await?),
        Command::Unban { user_id } => Ok(admin.unban(user_id).await?),
        Command::Trust { user_id } => Ok(admin.trust(user_id).await?),
        Command::Untrust { user_id } => Ok(admin.untrust(user_id).await?),
        Command::WipeUser { user_id } => {
            match admin.wipe_user(user_id).await? {
                Some(record) => println!("removed thread {} for user {user_id}", record.thread_id),
                None => println!("user {user_id} had no thread; verification and queue cleared"),
            }
            Ok(())
        }
        Command::WipeAll { yes } => {
            if !yes {
                anyhow::bail!("refusing to wipe without --yes");
            }
            let removed = admin.wipe_all().await?;
            println!("removed {removed} keys");
            Ok(())
        }
        Command::Set { key, value } => print_json(&admin.set(&key, &value).await?),
    }
}
