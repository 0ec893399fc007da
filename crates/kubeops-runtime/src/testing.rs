//! Shared test fixtures

use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use kubeops_common::Error;

use crate::client::{WatchEvent, WatchStream};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "testing.kubeops.dev",
    version = "v1",
    kind = "Widget",
    namespaced,
    status = "WidgetStatus",
    schema = "disabled"
)]
pub struct WidgetSpec {
    pub replicas: i32,
    pub image: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct WidgetStatus {
    pub ready: bool,
}

/// A widget with name, namespace, uid and resource version set
pub fn widget(namespace: &str, name: &str) -> Widget {
    let mut w = Widget::new(
        name,
        WidgetSpec {
            replicas: 1,
            image: "nginx:1.27".to_string(),
        },
    );
    w.metadata.namespace = Some(namespace.to_string());
    w.metadata.uid = Some(format!("uid-{}-{}", namespace, name));
    w.metadata.resource_version = Some("1".to_string());
    w
}

pub fn with_finalizers(mut w: Widget, finalizers: &[&str]) -> Widget {
    w.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
    w
}

pub fn deleting(mut w: Widget) -> Widget {
    w.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    w
}

/// A watch stream fed by the returned sender
pub fn channel_stream() -> (
    mpsc::UnboundedSender<Result<WatchEvent<Widget>, Error>>,
    WatchStream<Widget>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    (tx, stream)
}

/// Poll `check` until it holds, advancing (paused) time in small steps
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
