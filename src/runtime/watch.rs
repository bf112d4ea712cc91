use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::evaluator::{evaluate, required_symbols};
use crate::event::AppEvent;
use crate::feed::TickStreamManager;
use crate::model::condition::ConditionNode;

/// Binds one condition tree to a [`TickStreamManager`].
///
/// Setting a tree subscribes every symbol it references and drops the ones it no
/// longer needs. Each price update re-evaluates the tree and publishes
/// [`AppEvent::EvaluationChanged`] when the outcome flips.
pub struct ConditionWatch {
    manager: Arc<TickStreamManager>,
    source: String,
    min_rules: usize,
    tree: Option<ConditionNode>,
    last_result: Option<bool>,
}

impl ConditionWatch {
    pub fn new(manager: Arc<TickStreamManager>, source: impl Into<String>, min_rules: usize) -> Self {
        Self {
            manager,
            source: source.into(),
            min_rules,
            tree: None,
            last_result: None,
        }
    }

    /// Replace the tree and reconcile subscriptions. Returns the symbols now required.
    pub async fn set_tree(&mut self, tree: ConditionNode) -> BTreeSet<String> {
        let required = required_symbols(&tree);
        let (added, removed) = self.manager.reconcile(&required, &self.source).await;
        tracing::info!(
            tree = %tree.id(),
            required = required.len(),
            added = ?added,
            removed = ?removed,
            "Condition tree updated"
        );
        self.tree = Some(tree);
        self.refresh();
        required
    }

    /// Drop the tree and release its subscriptions.
    pub async fn clear(&mut self) {
        self.manager.reconcile(&BTreeSet::new(), &self.source).await;
        self.tree = None;
        self.refresh();
    }

    pub fn tree(&self) -> Option<&ConditionNode> {
        self.tree.as_ref()
    }

    /// Evaluate an arbitrary tree against the current prices.
    pub fn evaluate_tree(&self, tree: &ConditionNode) -> bool {
        evaluate(tree, &self.manager.store().snapshot())
    }

    /// Whether the current tree is met: it must have at least `min_rules` top-level
    /// rules and evaluate true.
    pub fn is_met(&self) -> bool {
        match &self.tree {
            Some(tree) => tree.rule_count() >= self.min_rules && self.evaluate_tree(tree),
            None => false,
        }
    }

    pub fn last_result(&self) -> Option<bool> {
        self.last_result
    }

    /// Re-evaluate and publish a notification if the outcome changed.
    /// Returns the new outcome when it changed.
    pub fn refresh(&mut self) -> Option<bool> {
        let satisfied = self.is_met();
        if self.last_result == Some(satisfied) {
            return None;
        }
        self.last_result = Some(satisfied);
        tracing::info!(satisfied, "Evaluation changed");
        let _ = self
            .manager
            .event_sender()
            .send(AppEvent::EvaluationChanged { satisfied });
        Some(satisfied)
    }

    /// Re-evaluate on every price update until `shutdown` flips to true.
    pub async fn follow(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.manager.events();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(AppEvent::PriceUpdated(_)) => {
                        self.refresh();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Event receiver lagged");
                        self.refresh();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}
