//! `saoclient` — data model management against a SAO gateway.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};

use sao_client::{default_repo, ClientConfig, OrderOptions, SaoClient};
use sao_common::cid;
use sao_proto::patch::{canonicalize, generate_patch};

#[derive(Parser)]
#[command(name = "saoclient", version, about = "SAO network client")]
struct Cli {
    /// client repo directory
    #[arg(long, global = true)]
    repo: Option<String>,

    /// platform (group) id proposals are scoped to
    #[arg(long, global = true, default_value = "sao")]
    platform: String,

    /// gateway HTTP API endpoint
    #[arg(long, global = true, default_value = "http://127.0.0.1:5151")]
    gateway: String,

    /// chain rpc endpoint, used with --client-publish
    #[arg(long = "chain-address", global = true, default_value = "http://localhost:26657")]
    chain_address: String,

    /// account name in the local keystore
    #[arg(long = "key-name", global = true, default_value = "default")]
    key_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// data model management
    #[command(subcommand)]
    Model(ModelCommand),
}

#[derive(Subcommand)]
enum ModelCommand {
    /// create a new data model
    Create(CreateArgs),
    /// generate a JSON-Patch between two content files
    PatchGen(PatchGenArgs),
    /// update an existing data model with a patch
    Update(UpdateArgs),
    /// update read/write permissions on a model
    UpdatePermission(UpdatePermissionArgs),
    /// load a data model
    Load(LoadArgs),
    /// terminate a data model
    Delete(DeleteArgs),
    /// list a model's commits
    Commits(CommitsArgs),
    /// renew data models
    Renew(RenewArgs),
    /// check models' status
    Status(StatusArgs),
    /// check a model's meta information
    Meta(MetaArgs),
    /// show a chain order
    Order(OrderArgs),
}

#[derive(Args)]
struct CreateArgs {
    /// data model content to create
    #[arg(long)]
    content: String,

    /// alias name for this data model
    #[arg(long)]
    name: Option<String>,

    /// lease duration in blocks
    #[arg(long, default_value_t = 365)]
    duration: i32,

    /// blocks to wait for the content to finish storing
    #[arg(long, default_value_t = 60)]
    delay: i32,

    /// how many copies to store
    #[arg(long, default_value_t = 1)]
    replica: i32,

    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// validation rule handed to the schema validator
    #[arg(long, default_value = "")]
    rule: String,

    /// extend information for the model (max 1024 bytes)
    #[arg(long = "extend-info", default_value = "")]
    extend_info: String,

    /// submit the MsgStore message from the client instead of the gateway
    #[arg(long = "client-publish", default_value_t = false)]
    client_publish: bool,
}

#[derive(Args)]
struct PatchGenArgs {
    /// origin content file
    #[arg(long)]
    origin: PathBuf,

    /// target content file
    #[arg(long)]
    target: PathBuf,
}

#[derive(Args)]
struct UpdateArgs {
    /// model alias or data id
    #[arg(long)]
    keyword: String,

    /// JSON-Patch document (use patch-gen to produce one)
    #[arg(long)]
    patch: String,

    #[arg(long, default_value_t = 365)]
    duration: i32,

    #[arg(long, default_value_t = 60)]
    delay: i32,

    #[arg(long, default_value_t = 1)]
    replica: i32,

    #[arg(long = "client-publish", default_value_t = false)]
    client_publish: bool,
}

#[derive(Args)]
struct UpdatePermissionArgs {
    #[arg(long = "data-id")]
    data_id: String,

    #[arg(long = "readonly-dids", value_delimiter = ',')]
    readonly_dids: Vec<String>,

    #[arg(long = "readwrite-dids", value_delimiter = ',')]
    readwrite_dids: Vec<String>,
}

#[derive(Args)]
struct LoadArgs {
    /// model alias, data id or tag
    #[arg(long)]
    keyword: String,

    /// model version, as listed by the commits command
    #[arg(long, default_value = "")]
    version: String,

    /// load the model state as of this commit
    #[arg(long = "commit-id", default_value = "")]
    commit_id: String,

    /// query without an identity (owner "all")
    #[arg(long, default_value_t = false)]
    public: bool,

    /// dump content to ./<dataid>.json
    #[arg(long, default_value_t = false)]
    dump: bool,
}

#[derive(Args)]
struct DeleteArgs {
    #[arg(long = "data-id")]
    data_id: String,
}

#[derive(Args)]
struct CommitsArgs {
    #[arg(long)]
    keyword: String,
}

#[derive(Args)]
struct RenewArgs {
    /// data ids to renew
    #[arg(long = "data-ids", value_delimiter = ',')]
    data_ids: Vec<String>,

    #[arg(long, default_value_t = 30)]
    duration: i32,

    #[arg(long, default_value_t = 60)]
    delay: i32,

    #[arg(long = "client-publish", default_value_t = false)]
    client_publish: bool,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long = "data-ids", value_delimiter = ',')]
    data_ids: Vec<String>,
}

#[derive(Args)]
struct MetaArgs {
    #[arg(long = "data-id")]
    data_id: String,
}

#[derive(Args)]
struct OrderArgs {
    #[arg(long = "order-id")]
    order_id: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Command::Model(cmd) = cli.command;

    // patch-gen is purely local, no account or gateway needed
    if let ModelCommand::PatchGen(args) = &cmd {
        let origin = std::fs::read(&args.origin).context("read origin")?;
        let target = std::fs::read(&args.target).context("read target")?;
        let patch = generate_patch(&origin, &target)?;
        let canonical = canonicalize(&target)?;
        println!("Patch  : {}", String::from_utf8_lossy(&patch));
        println!("Cid    : {}", cid::calculate_cid(&canonical));
        println!("Size   : {}", canonical.len());
        return Ok(());
    }

    let client = SaoClient::new(ClientConfig {
        gateway: cli.gateway,
        chain_address: cli.chain_address,
        platform: cli.platform,
        repo: default_repo(cli.repo.as_deref()),
        key_name: cli.key_name,
    })?;

    match cmd {
        ModelCommand::PatchGen(_) => unreachable!("handled above"),
        ModelCommand::Create(args) => {
            let opts = OrderOptions {
                alias: args.name.unwrap_or_default(),
                duration: args.duration,
                replica: args.replica,
                timeout: args.delay,
                tags: args.tags,
                rule: args.rule,
                extend_info: args.extend_info,
                client_publish: args.client_publish,
            };
            let model = client.create_model(args.content.as_bytes(), &opts).await?;
            println!("alias   : {}", model.alias);
            println!("data id : {}", model.data_id);
        }
        ModelCommand::Update(args) => {
            let opts = OrderOptions {
                duration: args.duration,
                replica: args.replica,
                timeout: args.delay,
                client_publish: args.client_publish,
                ..Default::default()
            };
            let model = client.update_model(&args.keyword, args.patch.as_bytes(), &opts).await?;
            println!("alias    : {}", model.alias);
            println!("data id  : {}", model.data_id);
            println!("commit id: {}", model.commit_id);
        }
        ModelCommand::UpdatePermission(args) => {
            let hash = client
                .update_permission(&args.data_id, args.readonly_dids, args.readwrite_dids)
                .await?;
            println!("permission updated, tx {}", hash);
        }
        ModelCommand::Load(args) => {
            let model = client
                .load_model(&args.keyword, &args.version, &args.commit_id, args.public)
                .await?;
            println!("alias   : {}", model.alias);
            println!("data id : {}", model.data_id);
            println!("commit  : {}", model.commit_id);
            println!("version : {}", model.version);
            println!("cid     : {}", model.cid);
            if args.dump {
                let path = format!("./{}.json", model.data_id);
                std::fs::write(&path, &model.content).context("dump content")?;
                println!("content dumped to {}", path);
            } else {
                println!("content : {}", String::from_utf8_lossy(&model.content));
            }
        }
        ModelCommand::Delete(args) => {
            let model = client.delete_model(&args.data_id).await?;
            println!("alias   : {}", model.alias);
            println!("data id : {} terminated", model.data_id);
        }
        ModelCommand::Commits(args) => {
            let model = client.show_commits(&args.keyword).await?;
            println!("alias   : {}", model.alias);
            println!("data id : {}", model.data_id);
            println!("Commits:");
            for (i, commit) in model.commits.iter().enumerate() {
                let (commit_id, height) = sao_proto::model::parse_commit(commit)
                    .map_err(|e| anyhow!("commit entry {}: {}", i, e))?;
                println!("  v{} {} (height {})", i, commit_id, height);
            }
        }
        ModelCommand::Renew(args) => {
            if args.data_ids.is_empty() {
                return Err(anyhow!("--data-ids must name at least one model"));
            }
            let results: HashMap<String, String> = client
                .renew_models(args.data_ids, args.duration, args.delay)
                .await?;
            let mut data_ids: Vec<&String> = results.keys().collect();
            data_ids.sort();
            for data_id in data_ids {
                let result = &results[data_id];
                match result.strip_prefix("SUCCESS=") {
                    Some(order_id) => println!("{} -> {}", data_id, order_id),
                    None => println!("{} -> {}", data_id, result),
                }
            }
        }
        ModelCommand::Status(args) => {
            for data_id in &args.data_ids {
                match client.model_status(data_id).await {
                    Ok(status) => {
                        let left = status.expire_height as i64 - status.latest_height;
                        if left >= 0 {
                            println!("[{}]: {}, expires in {} heights", data_id, status.state, left);
                        } else {
                            println!("[{}]: {}, expired {} heights ago", data_id, status.state, -left);
                        }
                    }
                    Err(e) => println!("[{}]: {}", data_id, e),
                }
            }
        }
        ModelCommand::Meta(args) => {
            let meta = client.model_meta(&args.data_id).await?;
            println!("alias   : {}", meta.alias);
            println!("data id : {}", meta.data_id);
            println!("owner   : {}", meta.owner);
            println!("order id: {}", meta.order_id);
            println!("cid     : {}", meta.cid);
            println!("Tags    : {}", meta.tags.join(", "));
            println!("Commits :");
            for commit in &meta.commits {
                println!("  {}", commit.replace('\u{1a}', " @ "));
            }
        }
        ModelCommand::Order(args) => {
            let order = client.order_info(args.order_id).await?;
            println!("order id : {}", order.id);
            println!("owner    : {}", order.owner);
            println!("data id  : {}", order.data_id);
            println!("status   : {:?}", order.status);
            println!("replica  : {}", order.replica);
            println!("expire   : {}", order.expire);
            for (provider, shard) in &order.shards {
                println!("  shard {} -> {} ({:?})", shard.cid, provider, shard.status);
            }
        }
    }
    Ok(())
}
