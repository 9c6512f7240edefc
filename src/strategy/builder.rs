//! Builds a [`Strategy`] tree from a JSON scheme.
//!
//! Every node is an object with a `type`. Apart from the structural keys (`type`,
//! `transport`, `child`, `children`) all of a node's keys are inherited by its
//! children, which may override them. This is how `host`, ports, `encrypted` or
//! `timeout` set once at the root reach the transport leaves:
//!
//! ```
//! # use pusher_client_sdk::strategy::build;
//! # use pusher_client_sdk::transport::TransportRegistry;
//! let scheme = serde_json::json!({
//!     "type": "sequential",
//!     "host": "ws.pusherapp.com",
//!     "unencryptedPort": 80,
//!     "encryptedPort": 443,
//!     "timeout": 15000,
//!     "children": [{ "type": "transport", "transport": "ws" }],
//! });
//! # #[cfg(feature = "ws")]
//! let strategy = build(&scheme, &TransportRegistry::default())?;
//! # Ok::<_, pusher_client_sdk::error::Error>(())
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use serde_with::{DurationMilliSeconds, serde_as};

use super::{DelayedStrategy, ParallelStrategy, SequentialStrategy, Strategy, TransportStrategy};
use crate::Result;
use crate::error::{Error, UnsupportedStrategy, UnsupportedTransport};
use crate::transport::{TransportOptions, TransportRegistry};

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SequentialOptions {
    #[serde(default, rename = "loop")]
    looping: bool,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    timeout_limit: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct DelayedOptions {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default)]
    delay: Duration,
}

/// Build the tree described by `scheme`, resolving transport names in `transports`.
///
/// Unknown strategy types and transport names are configuration errors; they are
/// reported here rather than when connecting.
pub fn build(scheme: &Value, transports: &TransportRegistry) -> Result<Strategy> {
    let node = scheme
        .as_object()
        .ok_or_else(|| Error::validation(format!("strategy scheme must be an object: {scheme}")))?;
    let kind = node.get("type").and_then(Value::as_str).unwrap_or_default();

    match kind {
        "transport" => build_transport(node, transports),
        "delayed" => {
            let options = inherited(node, &["type", "child"]);
            let child = node
                .get("child")
                .ok_or_else(|| Error::validation("delayed strategy requires a child"))?;
            let DelayedOptions { delay } = parse(&options)?;
            let child = build(&merged(options, child)?, transports)?;

            Ok(Strategy::Delayed(DelayedStrategy::new(child, delay)))
        }
        "sequential" => {
            let SequentialOptions {
                looping,
                timeout,
                timeout_limit,
            } = parse(&inherited(node, &["type", "children"]))?;
            let children = build_children(node, transports)?;

            Ok(Strategy::Sequential(SequentialStrategy::new(
                children,
                looping,
                timeout,
                timeout_limit,
            )))
        }
        "first_supported" => Ok(Strategy::FirstSupported(ParallelStrategy::first_supported(
            build_children(node, transports)?,
        ))),
        "all_supported" => Ok(Strategy::AllSupported(ParallelStrategy::new(
            build_children(node, transports)?,
        ))),
        "first_connected" => Ok(Strategy::FirstConnected(ParallelStrategy::new(
            build_children(node, transports)?,
        ))),
        "best_connected_ever" => Ok(Strategy::BestConnectedEver(ParallelStrategy::new(
            build_children(node, transports)?,
        ))),
        other => Err(UnsupportedStrategy {
            strategy: other.to_owned(),
        }
        .into()),
    }
}

fn build_transport(node: &Map<String, Value>, transports: &TransportRegistry) -> Result<Strategy> {
    let name = node
        .get("transport")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let factory = transports.get(name).ok_or_else(|| UnsupportedTransport {
        transport: name.to_owned(),
    })?;
    let options: TransportOptions = parse(&inherited(node, &["type", "transport"]))?;

    Ok(Strategy::Transport(TransportStrategy::new(
        name, factory, options,
    )))
}

fn build_children(node: &Map<String, Value>, transports: &TransportRegistry) -> Result<Vec<Strategy>> {
    let options = inherited(node, &["type", "children"]);
    let children = node
        .get("children")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::validation("composite strategy requires a children array"))?;

    children
        .iter()
        .map(|child| build(&merged(options.clone(), child)?, transports))
        .collect()
}

/// The keys of `node` its children inherit.
fn inherited(node: &Map<String, Value>, structural: &[&str]) -> Map<String, Value> {
    node.iter()
        .filter(|(key, _)| !structural.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// `child` layered over the inherited `options`.
fn merged(mut options: Map<String, Value>, child: &Value) -> Result<Value> {
    let child = child
        .as_object()
        .ok_or_else(|| Error::validation(format!("strategy scheme must be an object: {child}")))?;
    for (key, value) in child {
        options.insert(key.clone(), value.clone());
    }

    Ok(Value::Object(options))
}

fn parse<T: DeserializeOwned>(options: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(options.clone()))
        .map_err(|e| Error::validation(format!("invalid strategy options: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::Kind;
    use crate::transport::testing::MockFactory;

    fn registry() -> TransportRegistry {
        let (mock, _) = MockFactory::new("mock", true);
        TransportRegistry::empty().with("mock", mock)
    }

    #[test]
    fn unknown_type_is_unsupported_strategy() {
        let error = build(&json!({ "type": "round_robin" }), &registry()).unwrap_err();

        assert_eq!(error.kind(), Kind::Configuration);
        let unsupported = error.downcast_ref::<UnsupportedStrategy>().unwrap();
        assert_eq!(unsupported.strategy, "round_robin");
    }

    #[test]
    fn unknown_transport_is_unsupported_transport() {
        let error = build(
            &json!({ "type": "sequential", "children": [{ "type": "transport", "transport": "flash" }] }),
            &registry(),
        )
        .unwrap_err();

        assert_eq!(error.kind(), Kind::Configuration);
        assert!(error.downcast_ref::<UnsupportedTransport>().is_some());
    }

    #[test]
    fn options_are_inherited_and_overridable() {
        let strategy = build(
            &json!({
                "type": "first_connected",
                "key": "app",
                "host": "root.example.com",
                "encrypted": true,
                "encryptedPort": 443,
                "children": [
                    { "type": "transport", "transport": "mock" },
                    {
                        "type": "delayed",
                        "delay": 2000,
                        "child": { "type": "transport", "transport": "mock", "host": "child.example.com" },
                    },
                ],
            }),
            &registry(),
        )
        .unwrap();

        let Strategy::FirstConnected(parallel) = strategy else {
            panic!("expected first_connected");
        };
        let [Strategy::Transport(first), Strategy::Delayed(delayed)] = parallel.children() else {
            panic!("unexpected children");
        };
        let Strategy::Transport(second) = delayed.child() else {
            panic!("expected transport under delayed");
        };

        assert_eq!(first.options().host.as_deref(), Some("root.example.com"));
        assert_eq!(first.options().key, "app");
        assert!(first.options().encrypted);
        assert_eq!(second.options().host.as_deref(), Some("child.example.com"));
        assert_eq!(second.options().port(), Some(443));
        assert_eq!(delayed.delay(), Duration::from_secs(2));
    }

    #[test]
    fn first_supported_keeps_first_supported_child() {
        let (missing, _) = MockFactory::new("missing", false);
        let registry = registry().with("missing", missing);

        let strategy = build(
            &json!({
                "type": "first_supported",
                "children": [
                    { "type": "transport", "transport": "missing" },
                    { "type": "transport", "transport": "mock" },
                    { "type": "transport", "transport": "mock" },
                ],
            }),
            &registry,
        )
        .unwrap();

        let Strategy::FirstSupported(parallel) = strategy else {
            panic!("expected first_supported");
        };
        assert_eq!(parallel.children().len(), 1);
        assert!(strategy_is_transport(&parallel.children()[0], "mock"));
    }

    fn strategy_is_transport(strategy: &Strategy, name: &str) -> bool {
        matches!(strategy, Strategy::Transport(leaf) if leaf.name() == name)
    }

    #[test]
    fn malformed_options_are_validation_errors() {
        let error = build(
            &json!({ "type": "sequential", "timeout": "soon", "children": [] }),
            &registry(),
        )
        .unwrap_err();

        assert_eq!(error.kind(), Kind::Validation);
    }
}
