use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::ResourceExt;
use kube::api::DynamicObject;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use promwatch_k8s::{InformerEvent, InformerHandle, MonitoringClient, SharedInformerFactory};
use promwatch_types::{MONITORING_GROUP, MONITORING_VERSION, ResourceDescriptor};

mod cluster;
mod config;

use config::Config;

/// Promwatch - manage ServiceMonitors and watch prometheus-operator resources
#[derive(Parser, Debug)]
#[command(name = "promwatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Kubernetes context name (defaults to the current context)
    #[arg(long, global = true, value_name = "CONTEXT")]
    context: Option<String>,

    /// Timeout in seconds for ServiceMonitor requests and informer sync
    #[arg(
        long,
        global = true,
        value_name = "SECONDS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a ServiceMonitor
    Get { namespace: String, name: String },

    /// Create a ServiceMonitor for an application
    Create { namespace: String, name: String },

    /// Delete a ServiceMonitor
    Delete { namespace: String, name: String },

    /// List cached objects of a resource kind
    List {
        /// `servicemonitors`, or a full `resource.version.group`
        resource: String,

        /// Only list this namespace
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Print changes to a resource kind until interrupted
    Watch {
        /// `servicemonitors`, or a full `resource.version.group`
        resource: String,

        /// Only watch this namespace
        #[arg(short, long)]
        namespace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing for debugging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.timeout());

    let context = args.context.as_deref().or(config.cluster.context.as_deref());
    let client = cluster::connect(context).await?;

    let monitors = MonitoringClient::new(client.clone())
        .with_timeout(timeout)
        .with_port_suffix(config.client.port_suffix.clone());

    match args.command {
        Command::Get { namespace, name } => {
            print_json(&monitors.get(&namespace, &name).await?)?;
        }
        Command::Create { namespace, name } => {
            print_json(&monitors.create(&namespace, &name).await?)?;
        }
        Command::Delete { namespace, name } => {
            monitors.delete(&namespace, &name).await?;
            println!("servicemonitor {}/{} deleted", namespace, name);
        }
        Command::List {
            resource,
            namespace,
        } => {
            let factory = informer_factory(client, namespace.or(config.informers.namespace));
            let handle = synced_handle(&factory, &resource, timeout).await?;

            let mut lines: Vec<String> = handle.lister().list().iter().map(object_key).collect();
            lines.sort();
            for line in lines {
                println!("{}", line);
            }
        }
        Command::Watch {
            resource,
            namespace,
        } => {
            let shutdown = CancellationToken::new();
            let factory = informer_factory(client, namespace.or(config.informers.namespace))
                .with_shutdown(&shutdown);
            let handle = synced_handle(&factory, &resource, timeout).await?;

            handle.add_event_handler(|event: &InformerEvent<DynamicObject>| {
                println!("{}", describe_event(event));
            });

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            shutdown.cancel();
        }
    }

    Ok(())
}

fn informer_factory(client: kube::Client, namespace: Option<String>) -> SharedInformerFactory {
    let factory = SharedInformerFactory::new(client);
    match namespace {
        Some(namespace) => factory.with_namespace(namespace),
        None => factory,
    }
}

/// Resolve `resource` through the factory and wait for its cache to fill
async fn synced_handle(
    factory: &SharedInformerFactory,
    resource: &str,
    timeout: Duration,
) -> Result<InformerHandle> {
    let descriptor = parse_resource(resource)?;
    let handle = factory.for_resource(&descriptor)?;

    tokio::time::timeout(timeout, handle.wait_for_sync())
        .await
        .with_context(|| format!("Timed out waiting for {} to sync", descriptor))??;

    Ok(handle)
}

/// A bare plural means the prometheus-operator group and version
fn parse_resource(resource: &str) -> Result<ResourceDescriptor> {
    if resource.contains('.') {
        Ok(resource.parse::<ResourceDescriptor>()?)
    } else {
        Ok(ResourceDescriptor::new(
            MONITORING_GROUP,
            MONITORING_VERSION,
            resource,
        ))
    }
}

fn object_key(obj: &DynamicObject) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

fn describe_event(event: &InformerEvent<DynamicObject>) -> String {
    let verb = match event {
        InformerEvent::Added(_) => "ADDED",
        InformerEvent::Updated { .. } => "MODIFIED",
        InformerEvent::Deleted(_) => "DELETED",
    };
    format!("{:<9}{}", verb, object_key(event.object()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
