use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use keycloak_attribute_sync::{
    cli::{Command, Opts, RunArguments},
    controller::{self, SyncOrchestrator},
    crd::AttributeSync,
    keycloak::KeycloakProvider,
    logging::{self, controller::report_reconciled},
    store::{KubeSecretStore, KubeStatusStore, KubeTargetStore},
};
use kube::{
    Client, CustomResourceExt,
    runtime::{Controller, watcher},
};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "keycloak-attribute-sync";
const LOG_ENV: &str = "KEYCLOAK_ATTRIBUTE_SYNC_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to serialize CRD"))]
    SerializeCrd { source: serde_yaml::Error },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    match opts.command {
        Command::Crd => {
            let crd = serde_yaml::to_string(&AttributeSync::crd()).context(SerializeCrdSnafu)?;
            print!("{crd}");
        }
        Command::Run(run) => {
            logging::initialize_logging(LOG_ENV, APP_NAME).context(InitializeLoggingSnafu)?;
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                resource.kind = run.target.target_kind.as_str(),
                watch_namespace = ?run.watch_namespace,
                "starting {APP_NAME}"
            );

            let client = Client::try_default().await.context(CreateClientSnafu)?;
            run_controller(client, &run).await;
        }
    }

    Ok(())
}

async fn run_controller(client: Client, run: &RunArguments) {
    let api_resource = run.target.api_resource();
    let orchestrator = SyncOrchestrator::new(
        Arc::new(KubeSecretStore::new(client.clone())),
        Arc::new(KubeTargetStore::new(
            client.clone(),
            &api_resource,
            &run.field_manager,
        )),
        Arc::new(KubeStatusStore::new(client.clone(), &run.field_manager)),
        Arc::new(KeycloakProvider),
        run.conflict_policy(),
    );

    Controller::new(
        run.watch_namespace.get_api::<AttributeSync>(&client),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        controller::reconcile,
        controller::error_policy,
        Arc::new(orchestrator),
    )
    .for_each(|result| {
        report_reconciled(&client, &result);
        futures::future::ready(())
    })
    .await;
}
