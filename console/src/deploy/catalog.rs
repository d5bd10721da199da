//! Playbook sequence catalog
//!
//! Step order encodes real dependency ordering between components (a router
//! is installed before the core it routes for and removed after it). Shipped
//! sequences must never be reordered.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::deploy::fsm::Direction;
use crate::errors::ConsoleError;

/// One invocation of an external provisioning action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybookStep {
    /// Display name
    pub name: String,

    /// Playbook identifier handed to the step executor
    pub playbook: String,

    /// Classification tags; `uninstall` or `stop` mark an undeploy step
    pub tags: Vec<String>,
}

impl PlaybookStep {
    pub fn new(name: &str, playbook: &str, tags: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            playbook: playbook.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// A named, ordered list of steps executed as one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybookSequence {
    pub name: String,

    /// Component driven by this sequence when the caller names none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    pub steps: Vec<PlaybookStep>,
}

impl PlaybookSequence {
    pub fn new(name: &str, steps: Vec<PlaybookStep>) -> Self {
        Self {
            name: name.to_string(),
            component: None,
            steps,
        }
    }

    pub fn for_component(mut self, component: &str) -> Self {
        self.component = Some(component.to_string());
        self
    }

    /// Undeploy if any step carries an `uninstall` or `stop` tag
    pub fn direction(&self) -> Direction {
        Direction::from_tags(
            self.steps
                .iter()
                .flat_map(|step| step.tags.iter().map(String::as_str)),
        )
    }
}

/// Read-only registry of sequences by name
#[derive(Debug, Clone)]
pub struct Catalog {
    sequences: BTreeMap<String, PlaybookSequence>,
}

impl Catalog {
    /// Build a catalog from a fixed list of sequences
    pub fn new(sequences: impl IntoIterator<Item = PlaybookSequence>) -> Self {
        Self {
            sequences: sequences
                .into_iter()
                .map(|sequence| (sequence.name.clone(), sequence))
                .collect(),
        }
    }

    /// The sequences shipped with the console
    pub fn builtin() -> Self {
        Self::new(builtin_sequences())
    }

    /// Look up a sequence; a missing name is a configuration error
    pub fn get(&self, name: &str) -> Result<&PlaybookSequence, ConsoleError> {
        self.sequences
            .get(name)
            .ok_or_else(|| ConsoleError::UnknownSequence(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sequences.keys().map(String::as_str)
    }

    pub fn sequences(&self) -> impl Iterator<Item = &PlaybookSequence> {
        self.sequences.values()
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_sequences() -> Vec<PlaybookSequence> {
    vec![
        PlaybookSequence::new(
            "k8s-install",
            vec![
                PlaybookStep::new("Prepare nodes", "k8s/prepare-nodes.yml", &["k8s", "install"]),
                PlaybookStep::new(
                    "Install container runtime",
                    "k8s/container-runtime.yml",
                    &["k8s", "install"],
                ),
                PlaybookStep::new(
                    "Bootstrap control plane",
                    "k8s/control-plane.yml",
                    &["k8s", "install"],
                ),
                PlaybookStep::new("Join workers", "k8s/join-workers.yml", &["k8s", "install"]),
                PlaybookStep::new("Install CNI", "k8s/cni.yml", &["k8s", "install"]),
            ],
        )
        .for_component("kubernetes"),
        PlaybookSequence::new(
            "k8s-uninstall",
            vec![
                PlaybookStep::new("Reset cluster", "k8s/reset.yml", &["k8s", "uninstall"]),
                PlaybookStep::new(
                    "Remove container runtime",
                    "k8s/container-runtime-remove.yml",
                    &["k8s", "uninstall"],
                ),
            ],
        )
        .for_component("kubernetes"),
        PlaybookSequence::new(
            "5gc-install",
            vec![
                PlaybookStep::new("router", "5gc/router-install.yml", &["5gc", "install"]),
                PlaybookStep::new("core", "5gc/core-install.yml", &["5gc", "install"]),
            ],
        )
        .for_component("5gc"),
        PlaybookSequence::new(
            "5gc-uninstall",
            vec![
                PlaybookStep::new("core", "5gc/core-uninstall.yml", &["5gc", "uninstall"]),
                PlaybookStep::new("router", "5gc/router-uninstall.yml", &["5gc", "uninstall"]),
            ],
        )
        .for_component("5gc"),
        PlaybookSequence::new(
            "gnb-deploy",
            vec![
                PlaybookStep::new("Build srsRAN", "gnb/build.yml", &["gnb", "install"]),
                PlaybookStep::new("Configure gNB", "gnb/configure.yml", &["gnb", "install"]),
                PlaybookStep::new("Start gNB", "gnb/start.yml", &["gnb", "start"]),
            ],
        )
        .for_component("srsran-gnb"),
        PlaybookSequence::new(
            "gnb-undeploy",
            vec![
                PlaybookStep::new("Stop gNB", "gnb/stop.yml", &["gnb", "stop"]),
                PlaybookStep::new("Remove gNB", "gnb/uninstall.yml", &["gnb", "uninstall"]),
            ],
        )
        .for_component("srsran-gnb"),
        PlaybookSequence::new(
            "ru-sim-deploy",
            vec![
                PlaybookStep::new("Install RU simulator", "ru-sim/install.yml", &["ru", "install"]),
                PlaybookStep::new("Start RU simulator", "ru-sim/start.yml", &["ru", "start"]),
            ],
        )
        .for_component("ru-simulator"),
        PlaybookSequence::new(
            "ru-sim-stop",
            vec![PlaybookStep::new("Stop RU simulator", "ru-sim/stop.yml", &["ru", "stop"])],
        )
        .for_component("ru-simulator"),
    ]
}
