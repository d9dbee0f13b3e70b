//! `create_agent` - provision an agent on this host.
//!
//! Output contract: stdout carries exactly one line. On success it is
//! `Agent <name> created successfully`; on failure it is a single-line
//! error description and the exit code is non-zero. Automation drives
//! this command and parses nothing else.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use warren::{
    AccountManager, AgentProvisioner, IdentityStore, NoopAccounts, SharedFolderGuard,
    SystemAccounts,
};

/// Provision an isolated agent account with shared-folder access
#[derive(Parser, Debug)]
#[command(name = "create_agent")]
#[command(about = "Create an agent identity, home directory, and shared-folder grant")]
struct Args {
    /// Name of the agent to create (1-64 alphanumeric or underscore)
    name: String,

    /// Directory under which agent homes are allocated
    #[arg(long, default_value = "/home")]
    agent_root: PathBuf,

    /// The shared exchange directory every agent can read and write
    #[arg(long, default_value = "/shared_user")]
    shared_dir: PathBuf,

    /// Path to the identity store shared with the relay server
    #[arg(long, default_value = "/var/lib/warren/agents.json")]
    identity_store: PathBuf,

    /// Skip OS account creation (hosts without useradd, tests)
    #[arg(long)]
    no_account: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    let name = args.name.clone();

    match run(args).await {
        Ok(()) => println!("Agent {name} created successfully"),
        Err(e) => {
            // The single observable output: one line, non-zero exit.
            println!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let store = Arc::new(IdentityStore::open(&args.identity_store).await?);
    let guard = Arc::new(SharedFolderGuard::new(&args.shared_dir));
    let accounts: Arc<dyn AccountManager> = if args.no_account {
        Arc::new(NoopAccounts)
    } else {
        Arc::new(SystemAccounts)
    };

    let provisioner = AgentProvisioner::new(&args.agent_root, store, guard, accounts);
    provisioner.create_agent(&args.name).await?;
    Ok(())
}
