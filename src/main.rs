//! kubeops - ConfigMirror operator

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use kubeops::mirror::FIELD_MANAGER;
use kubeops::{ConfigMirror, ConfigMirrorController, MirrorCleanup};
use kubeops_common::settings::{DEFAULT_LEASE_NAMESPACE, DEFAULT_OPERATOR_NAME};
use kubeops_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kubeops_common::OperatorSettings;
use kubeops_runtime::{EntityClient, KubeEntityClient, Operator, Registration};

/// kubeops - mirrors ConfigMaps across namespaces
#[derive(Parser, Debug)]
#[command(name = "kubeops", version, about, long_about = None)]
struct Cli {
    /// Print the ConfigMirror CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Install or update the CRD with server-side apply before starting
    #[arg(long, env = "KUBEOPS_INSTALL_CRDS")]
    install_crds: bool,

    /// Operator name, used as field manager and lease name prefix
    #[arg(long, env = "KUBEOPS_OPERATOR_NAME", default_value = DEFAULT_OPERATOR_NAME)]
    name: String,

    /// Only watch this namespace
    #[arg(long, env = "KUBEOPS_NAMESPACE")]
    namespace: Option<String>,

    /// Run leader election so only one replica reconciles
    #[arg(long, env = "KUBEOPS_LEADER_ELECTION")]
    leader_election: bool,

    /// Namespace of the leader election Lease
    #[arg(long, env = "KUBEOPS_LEASE_NAMESPACE", default_value = DEFAULT_LEASE_NAMESPACE)]
    lease_namespace: String,

    /// Lease duration in seconds
    #[arg(long, env = "KUBEOPS_LEASE_DURATION_SECS", default_value_t = 15)]
    lease_duration_secs: u64,

    /// Lease renew interval in seconds
    #[arg(long, env = "KUBEOPS_RENEW_INTERVAL_SECS", default_value_t = 5)]
    renew_interval_secs: u64,

    /// Server-side watch timeout in seconds
    #[arg(long, env = "KUBEOPS_WATCH_TIMEOUT_SECS", default_value_t = kubeops_common::settings::DEFAULT_WATCH_TIMEOUT_SECS)]
    watch_timeout_secs: u32,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "KUBEOPS_PLAIN_LOGS")]
    plain_logs: bool,
}

impl Cli {
    fn settings(&self) -> OperatorSettings {
        OperatorSettings {
            namespace: self.namespace.clone(),
            leader_election: self.leader_election,
            lease_namespace: self.lease_namespace.clone(),
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_interval: Duration::from_secs(self.renew_interval_secs),
            watch_timeout_secs: self.watch_timeout_secs,
            ..OperatorSettings::named(&self.name)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ConfigMirror::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: cli.name.clone(),
        format: if cli.plain_logs {
            LogFormat::Plain
        } else {
            LogFormat::Json
        },
    })?;

    let settings = cli.settings();
    settings.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.install_crds {
        ensure_crd_installed(&client).await?;
    }

    let mirrors: Arc<dyn EntityClient<ConfigMirror>> =
        Arc::new(KubeEntityClient::<ConfigMirror>::namespaced(client.clone(), &settings.name));
    let registration = Registration::new(Arc::clone(&mirrors))
        .controller(ConfigMirrorController::new(client.clone(), mirrors))
        .finalizer(MirrorCleanup::new(client.clone()));

    let operator = Operator::new(client, settings)?.register(registration)?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    operator.run(token).await?;
    Ok(())
}

/// Install or update the ConfigMirror CRD
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing ConfigMirror CRD...");
    crds.patch(
        "configmirrors.kubeops.dev",
        &params,
        &Patch::Apply(&ConfigMirror::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ConfigMirror CRD: {}", e))?;
    Ok(())
}
