//! Wires the controller core against a real cluster with a toy
//! engine, watching templates and printing the constraints that flow
//! back out of the watch manager.
//!
//! Run against the current kubeconfig context:
//!
//! ```sh
//! cargo run --example controller
//! ```

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion,
};
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_core::{
    ConstraintTemplate, Engine, EngineError, NoopTracker, CONSTRAINT_GROUP, CONSTRAINT_VERSION,
};
use warden_runtime::{assemble, bootstrap::RuntimeConfig, KubeCache, KubeCluster};

/// An engine that accepts any non-empty program and derives a bare
/// cluster-scoped schema. Stands in for the real policy engine.
#[derive(Default)]
struct EchoEngine {
    templates: Mutex<HashMap<String, ConstraintTemplate>>,
}

#[async_trait]
impl Engine for EchoEngine {
    async fn create_schema(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<CustomResourceDefinition, EngineError> {
        if template.spec.target.source.trim().is_empty() {
            return Err(EngineError::Parse("empty policy program".to_string()));
        }
        Ok(CustomResourceDefinition {
            metadata: Default::default(),
            spec: CustomResourceDefinitionSpec {
                group: CONSTRAINT_GROUP.to_string(),
                names: CustomResourceDefinitionNames {
                    kind: template.kind_name().to_string(),
                    plural: template.constraint_plural(),
                    ..Default::default()
                },
                scope: "Cluster".to_string(),
                versions: vec![CustomResourceDefinitionVersion {
                    name: CONSTRAINT_VERSION.to_string(),
                    served: true,
                    storage: true,
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        })
    }

    async fn add_template(&self, template: &ConstraintTemplate) -> Result<(), EngineError> {
        self.templates
            .lock()
            .insert(template.name_any(), template.clone());
        Ok(())
    }

    async fn remove_template(&self, name: &str) -> Result<(), EngineError> {
        self.templates.lock().remove(name);
        Ok(())
    }

    async fn get_template(&self, name: &str) -> Result<Option<ConstraintTemplate>, EngineError> {
        Ok(self.templates.lock().get(name).cloned())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let client = Client::try_default().await?;
    let config = RuntimeConfig::default();
    let mut registry = Registry::default();

    let mut runtime = assemble(
        Arc::new(KubeCluster::new(client.clone(), config.namespace.clone())),
        Arc::new(EchoEngine::default()),
        Arc::new(KubeCache::new(client.clone())),
        Arc::new(NoopTracker),
        &mut registry,
        &config,
    )?;

    // the constraint reconciler would live here; we just log
    let mut constraints = runtime
        .take_constraint_events()
        .expect("constraint events already taken");
    tokio::spawn(async move {
        while let Some(obj) = constraints.recv().await {
            info!(
                kind = obj.types.as_ref().map_or("<unknown>", |t| t.kind.as_str()),
                name = %obj.name_any(),
                "constraint event"
            );
        }
    });

    // template changes drive both reconcilers
    let templates = runtime.templates.clone();
    let aggregator = runtime.aggregator.clone();
    let template_api = Api::<ConstraintTemplate>::all(client);
    tokio::spawn(async move {
        let stream = watcher(template_api, watcher::Config::default())
            .default_backoff()
            .touched_objects();
        futures::pin_mut!(stream);
        while let Ok(Some(template)) = stream.try_next().await {
            let name = template.name_any();
            templates.enqueue(&name);
            aggregator.enqueue(&name);
        }
    });

    let done = CancellationToken::new();
    tokio::spawn({
        let done = done.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            done.cancel();
        }
    });

    runtime.run(done).await?;
    Ok(())
}
