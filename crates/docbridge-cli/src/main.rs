//! docbridge CLI
//!
//! Usage:
//!   docbridge about
//!   docbridge object-id-date 52965c27aaaaaaaaaaaaaaaa
//!   docbridge find test.people --filter '{"name": "Alice"}' --limit 10
//!   docbridge insert test.people '{"name": "Alice"}'
//!   docbridge update test.people '{"name": "Alice"}' '{"$set": {"age": 31}}' --options MONGO_UPDATE_UPSERT
//!   docbridge --memory insert-batch test.people '[{"n": 1}, {"n": 2}]'
//!
//! Results are printed as pretty JSON on stdout; logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docbridge_mongodb::{BridgeConfig, Registry, Reply, Server};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "docbridge")]
#[command(about = "Run document operations against MongoDB", long_about = None)]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(long, global = true, default_value = "localhost")]
    address: String,

    /// Server port
    #[arg(long, global = true, default_value = "27017")]
    port: u16,

    /// Use the in-memory driver instead of a server
    #[arg(long, global = true)]
    memory: bool,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Identifier field name
    #[arg(long, global = true)]
    id_field: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the bridge identification string
    About,
    /// Print the bridge version
    Version,
    /// Generate a new ObjectId
    ObjectId,
    /// Print the creation time encoded in an ObjectId
    ObjectIdDate {
        id: String,
    },
    /// Query a collection
    Find {
        /// Namespace (database.collection)
        namespace: String,

        /// Query document
        #[arg(long, default_value = "{}")]
        filter: String,

        /// Projection document
        #[arg(long)]
        projection: Option<String>,

        #[arg(long, default_value = "0")]
        limit: i32,

        #[arg(long, default_value = "0")]
        skip: i32,

        /// Option symbols, e.g. MONGO_PARTIAL
        #[arg(long)]
        options: Option<String>,
    },
    /// Insert one document
    Insert {
        namespace: String,
        document: String,
    },
    /// Insert an array of documents
    InsertBatch {
        namespace: String,
        documents: String,
        #[arg(long)]
        options: Option<String>,
    },
    /// Update documents matching a reference
    Update {
        namespace: String,
        reference: String,
        document: String,
        #[arg(long)]
        options: Option<String>,
    },
    /// Remove documents matching a reference
    Remove {
        namespace: String,
        reference: String,
    },
    /// Run a database command
    Command {
        database: String,
        command: String,
    },
    /// Create an index
    CreateIndex {
        namespace: String,
        keys: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        options: Option<String>,
    },
}

impl Commands {
    fn needs_connection(&self) -> bool {
        !matches!(
            self,
            Commands::About | Commands::Version | Commands::ObjectId | Commands::ObjectIdDate { .. }
        )
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_json(label: &str, text: &str) -> Result<JsonValue> {
    serde_json::from_str(text).with_context(|| format!("Invalid JSON for {}", label))
}

/// Positional arguments, with the identifier-field override after the namespace
fn with_namespace(namespace: &str, id_field: &Option<String>, rest: Vec<JsonValue>) -> Vec<JsonValue> {
    let mut args = vec![json!(namespace)];
    if let Some(field) = id_field {
        args.push(json!(field));
    }
    args.extend(rest);
    args
}

fn run(cli: &Cli, server: &Server) -> Result<Reply> {
    let id = &cli.id_field;
    let reply = match &cli.command {
        Commands::About => server.about(&[], None)?,
        Commands::Version => server.version(&[], None)?,
        Commands::ObjectId => server.object_id(&[], None)?,
        Commands::ObjectIdDate { id } => server.object_id_date(&[json!(id)], None)?,
        Commands::Find {
            namespace,
            filter,
            projection,
            limit,
            skip,
            options,
        } => {
            let projection = match projection {
                Some(text) => parse_json("projection", text)?,
                None => json!({}),
            };
            let mut rest = vec![parse_json("filter", filter)?, projection, json!(limit), json!(skip)];
            if let Some(options) = options {
                rest.push(json!(options));
            }
            server.retrieve(&with_namespace(namespace, id, rest), None)?
        }
        Commands::Insert { namespace, document } => {
            let rest = vec![parse_json("document", document)?];
            server.insert(&with_namespace(namespace, id, rest), None)?
        }
        Commands::InsertBatch {
            namespace,
            documents,
            options,
        } => {
            let mut rest = vec![parse_json("documents", documents)?];
            rest.extend(options.iter().map(|o| json!(o)));
            server.insert_batch(&with_namespace(namespace, id, rest), None)?
        }
        Commands::Update {
            namespace,
            reference,
            document,
            options,
        } => {
            let mut rest = vec![parse_json("reference", reference)?, parse_json("document", document)?];
            rest.extend(options.iter().map(|o| json!(o)));
            server.update(&with_namespace(namespace, id, rest), None)?
        }
        Commands::Remove { namespace, reference } => {
            let rest = vec![parse_json("reference", reference)?];
            server.remove(&with_namespace(namespace, id, rest), None)?
        }
        Commands::Command { database, command } => {
            let rest = vec![parse_json("command", command)?];
            server.command(&with_namespace(database, id, rest), None)?
        }
        Commands::CreateIndex {
            namespace,
            keys,
            name,
            options,
        } => {
            let mut rest = vec![parse_json("keys", keys)?, json!(name.clone().unwrap_or_default())];
            rest.extend(options.iter().map(|o| json!(o)));
            server.create_index(&with_namespace(namespace, id, rest), None)?
        }
    };
    Ok(reply)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = BridgeConfig::from_env().with_workers(1);
    if let Some(field) = &cli.id_field {
        config = config.with_id_field(field);
    }
    let registry = Registry::start(config)?;

    let server = if cli.memory {
        Server::memory(&registry)
    } else {
        Server::mongo(&registry)
    };

    if cli.command.needs_connection() {
        debug!(address = %cli.address, port = cli.port, memory = cli.memory, "Opening connection");
        let opened = server.open(&[json!({"address": cli.address, "port": cli.port})], None)?;
        if let Reply::Value(value) = &opened {
            if value["ok"] == json!(false) {
                bail!("Failed to connect: {}", value["ErrorMessage"]);
            }
        }
    }

    let reply = run(&cli, &server)?;
    match reply {
        Reply::Value(JsonValue::String(text)) => println!("{}", text),
        Reply::Value(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Reply::Pending => bail!("Unexpected asynchronous reply"),
    }

    if server.is_open() {
        server.close(&[], None)?;
    }
    registry.shutdown();
    info!("Done");
    Ok(())
}
