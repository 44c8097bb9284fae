//! Watch-backed object caches
//!
//! Each watched kind is mirrored into a `kube` reflector [`Store`]. The raw
//! watch stream is turned into [`ResourceEvent`] deltas against that store,
//! so a relist (`Init` .. `InitDone`) surfaces only the objects that really
//! appeared, changed or vanished.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt, TryStreamExt};
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

/// A change observed on a watched object
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

/// Consumer of watch deltas
#[async_trait]
pub trait EventHandler<K>: Send + Sync {
    async fn handle(&self, event: ResourceEvent<K>);
}

/// `namespace/name`, or `name` for cluster-scoped objects
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// True once the store saw its first complete listing
pub fn is_ready<K>(store: &Store<K>) -> bool
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    matches!(store.wait_until_ready().now_or_never(), Some(Ok(())))
}

struct Relist<K: Resource> {
    seen: HashSet<ObjectRef<K>>,
    deltas: Vec<ResourceEvent<K>>,
}

/// Applies watch events to a reflector store and reports what changed
pub struct Reflector<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer: Writer<K>,
    reader: Store<K>,
    relist: Option<Relist<K>>,
}

impl<K> Reflector<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new(writer: Writer<K>) -> Self {
        let reader = writer.as_reader();
        Self {
            writer,
            reader,
            relist: None,
        }
    }

    pub fn reader(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Apply one event; relist deltas are held back until `InitDone` swaps the store
    pub fn step(&mut self, event: watcher::Event<K>) -> Vec<ResourceEvent<K>> {
        let deltas = match &event {
            watcher::Event::Apply(obj) => {
                let key = ObjectRef::from_obj(obj);
                let old = self.reader.get(&key);
                self.writer.apply_watcher_event(&event);
                let new = self
                    .reader
                    .get(&key)
                    .unwrap_or_else(|| Arc::new(obj.clone()));
                return vec![match old {
                    Some(old) => ResourceEvent::Updated { old, new },
                    None => ResourceEvent::Added(new),
                }];
            }
            watcher::Event::Delete(obj) => {
                let old = self.reader.get(&ObjectRef::from_obj(obj));
                vec![ResourceEvent::Deleted(
                    old.unwrap_or_else(|| Arc::new(obj.clone())),
                )]
            }
            watcher::Event::Init => {
                self.relist = Some(Relist {
                    seen: HashSet::new(),
                    deltas: Vec::new(),
                });
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                if let Some(relist) = self.relist.as_mut() {
                    let key = ObjectRef::from_obj(obj);
                    let new = Arc::new(obj.clone());
                    match self.reader.get(&key) {
                        None => relist.deltas.push(ResourceEvent::Added(new)),
                        Some(old) if old.resource_version() != obj.resource_version() => {
                            relist.deltas.push(ResourceEvent::Updated { old, new })
                        }
                        Some(_) => {}
                    }
                    relist.seen.insert(key);
                }
                Vec::new()
            }
            watcher::Event::InitDone => match self.relist.take() {
                Some(Relist { seen, mut deltas }) => {
                    deltas.extend(
                        self.reader
                            .state()
                            .into_iter()
                            .filter(|obj| !seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                            .map(ResourceEvent::Deleted),
                    );
                    deltas
                }
                None => Vec::new(),
            },
        };
        self.writer.apply_watcher_event(&event);
        deltas
    }
}

/// Drive one watcher until its stream ends, keeping the store behind `writer`
/// current and forwarding every delta to `handler`
pub async fn run<K>(api: Api<K>, writer: Writer<K>, handler: Arc<dyn EventHandler<K>>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    info!("Starting {} informer", kind);

    let mut reflector = Reflector::new(writer);
    let reader = reflector.reader();
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .map_err(|e| e.to_string())
        .boxed();

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("{} watch error: {}", kind, e);
                continue;
            }
        };
        let first_sync = matches!(event, watcher::Event::InitDone) && !is_ready(&reader);

        let deltas = reflector.step(event);
        if first_sync {
            info!("{} informer synced ({} objects)", kind, reader.state().len());
        } else if !deltas.is_empty() {
            debug!("{} informer produced {} changes", kind, deltas.len());
        }
        for delta in deltas {
            handler.handle(delta).await;
        }
    }

    warn!("{} informer stream ended", kind);
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;
    use kube::runtime::reflector;
    use std::time::Duration;

    fn node(name: &str, version: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn summary(deltas: &[ResourceEvent<Node>]) -> Vec<String> {
        let mut lines: Vec<String> = deltas
            .iter()
            .map(|d| match d {
                ResourceEvent::Added(n) => format!("added {}", n.name_any()),
                ResourceEvent::Updated { old, new } => format!(
                    "updated {} {}->{}",
                    new.name_any(),
                    old.resource_version().unwrap_or_default(),
                    new.resource_version().unwrap_or_default()
                ),
                ResourceEvent::Deleted(n) => format!("deleted {}", n.name_any()),
            })
            .collect();
        lines.sort();
        lines
    }

    fn synced_reflector(nodes: &[Node]) -> Reflector<Node> {
        let (_, writer) = reflector::store::<Node>();
        let mut r = Reflector::new(writer);
        r.step(watcher::Event::Init);
        for n in nodes {
            r.step(watcher::Event::InitApply(n.clone()));
        }
        r.step(watcher::Event::InitDone);
        r
    }

    #[test]
    fn test_apply_and_delete_report_previous_copy() {
        let mut r = synced_reflector(&[]);

        let added = r.step(watcher::Event::Apply(node("a", "1")));
        assert_eq!(summary(&added), vec!["added a"]);

        let updated = r.step(watcher::Event::Apply(node("a", "2")));
        assert_eq!(summary(&updated), vec!["updated a 1->2"]);

        let deleted = r.step(watcher::Event::Delete(node("a", "3")));
        assert_eq!(summary(&deleted), vec!["deleted a"]);
        assert!(r.reader().state().is_empty());
    }

    #[test]
    fn test_relist_reports_only_real_changes() {
        let mut r = synced_reflector(&[node("kept", "1"), node("changed", "1"), node("gone", "1")]);

        assert!(r.step(watcher::Event::Init).is_empty());
        for n in [node("kept", "1"), node("changed", "2"), node("new", "1")] {
            assert!(r.step(watcher::Event::InitApply(n)).is_empty());
        }
        // the store still serves the old listing until the relist completes
        assert!(r.reader().get(&ObjectRef::new("gone")).is_some());

        let deltas = r.step(watcher::Event::InitDone);
        assert_eq!(
            summary(&deltas),
            vec!["added new", "deleted gone", "updated changed 1->2"]
        );
        assert_eq!(r.reader().state().len(), 3);
        assert!(r.reader().get(&ObjectRef::new("gone")).is_none());
    }

    #[tokio::test]
    async fn test_store_becomes_ready_after_first_listing() {
        let (_, writer) = reflector::store::<Node>();
        let mut r = Reflector::new(writer);
        let reader = r.reader();
        assert!(!is_ready(&reader));

        r.step(watcher::Event::Init);
        r.step(watcher::Event::InitApply(node("a", "1")));
        assert!(!is_ready(&reader));

        let deltas = r.step(watcher::Event::InitDone);
        assert_eq!(summary(&deltas), vec!["added a"]);
        tokio::time::timeout(Duration::from_secs(1), reader.wait_until_ready())
            .await
            .unwrap()
            .unwrap();
        assert!(is_ready(&reader));
    }
}
