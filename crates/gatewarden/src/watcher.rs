//! Change-notification contracts for external collaborators.

/// Callback invoked when another enforcer instance changes the shared
/// policy store.
pub type UpdateCallback = Box<dyn Fn() + Send + Sync>;

/// Observes policy changes across enforcer instances.
///
/// The enforcer calls [`update`](Watcher::update) fire-and-forget after a
/// successful mutation when auto-notify is enabled. Implementations relay
/// the notification to their peers, whose installed callback (by default a
/// policy reload) brings them up to date.
pub trait Watcher: Send + Sync {
    /// Install the callback to run when a peer reports a change.
    fn set_update_callback(&mut self, callback: UpdateCallback) -> anyhow::Result<()>;

    /// Notify peers that this instance changed the policy.
    fn update(&mut self) -> anyhow::Result<()>;
}

/// Receives policy mutations instead of the local model, for deployments
/// that serialize all writes through an external coordinator. When a
/// dispatcher is installed and auto-notify is enabled, mutating calls hand
/// their rules here and apply nothing locally.
pub trait Dispatcher: Send + Sync {
    fn add_policies(&mut self, sec: &str, ptype: &str, rules: &[Vec<String>]) -> anyhow::Result<()>;

    fn remove_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rules: &[Vec<String>],
    ) -> anyhow::Result<()>;

    fn clear_policy(&mut self) -> anyhow::Result<()>;
}
