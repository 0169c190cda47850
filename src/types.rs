//! Data structures shared between the receiver, the reconciler and the
//! audit log.
//!
//! Nothing here is persisted directly.  Containers are read live from the
//! runtime on every pass, plans are rebuilt from scratch each time and a
//! [`PassOutcome`] only survives as the audit entry it is rendered into.

use std::collections::{BTreeMap, BTreeSet};

/// A running (or stopped) container that belongs to the managed stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerDescriptor {
    pub name: String,
    pub image: String,
}

impl ContainerDescriptor {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
}

/// What a single reconciliation pass intends to do.
///
/// Built from the pending signals and the live container list, executed
/// once and then dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    pub images_to_pull: BTreeSet<String>,
    /// Container name -> image it runs.  Kept together so that a failed
    /// pull can spare exactly the containers depending on it.
    pub containers_to_rebuild: BTreeMap<String, String>,
}

impl UpdatePlan {
    /// Selects every container whose name or image exactly matches one of
    /// the pending signals.
    pub fn build(signals: &BTreeSet<String>, containers: &[ContainerDescriptor]) -> Self {
        let mut plan = Self::default();
        for container in containers {
            if signals.contains(&container.name) || signals.contains(&container.image) {
                plan.images_to_pull.insert(container.image.clone());
                plan.containers_to_rebuild
                    .insert(container.name.clone(), container.image.clone());
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.containers_to_rebuild.is_empty()
    }
}

/// Result of a pass that had pending signals to work on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassResult {
    pub pulled_images: BTreeSet<String>,
    pub rebuilt_containers: BTreeSet<String>,
    /// Image -> reason, one entry per pull that did not succeed.
    pub pull_failures: BTreeMap<String, String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The token store held no signals.
    NoUpdate,
    Completed(PassResult),
}

impl PassOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            PassOutcome::NoUpdate => true,
            PassOutcome::Completed(result) => result.error.is_none(),
        }
    }

    /// Renders the outcome as an audit entry: one unindented header line
    /// followed by tab-indented detail lines.
    pub fn audit_lines(&self, timestamp: &str) -> Vec<String> {
        let result = match self {
            PassOutcome::NoUpdate => return vec![format!("{timestamp} No update")],
            PassOutcome::Completed(result) => result,
        };

        let header = match &result.error {
            Some(error) => {
                let first = error.lines().next().unwrap_or_default();
                format!("{timestamp} Error: {first}")
            }
            None if result.rebuilt_containers.is_empty() => {
                format!("{timestamp} No matching containers")
            }
            None => format!(
                "{timestamp} Updated: {}",
                result
                    .rebuilt_containers
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };

        let mut lines = vec![header];
        for image in &result.pulled_images {
            lines.push(format!("\tpulled {image}"));
        }
        for name in &result.rebuilt_containers {
            lines.push(format!("\trebuilt {name}"));
        }
        for (image, reason) in &result.pull_failures {
            let mut reason_lines = reason.lines();
            let first = reason_lines.next().unwrap_or_default();
            lines.push(format!("\tpull failed for {image}: {first}"));
            for line in reason_lines {
                lines.push(format!("\t\t{line}"));
            }
        }
        if let Some(error) = &result.error {
            for line in error.lines().skip(1) {
                lines.push(format!("\t{line}"));
            }
        }
        lines
    }
}
