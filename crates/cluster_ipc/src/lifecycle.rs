use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::transport::Socket;

/// Stage names the runtime fires itself.
pub mod stage {
    /// Fired when the master announces the cluster is up; receives the socket
    /// handle that came with the announcement, if any.
    pub const READY: &str = "ready";
    pub const BEFORE_STOP: &str = "beforeStop";
    pub const STOP: &str = "stop";
}

#[derive(Debug, Error)]
#[error("lifecycle stage `{stage}` failed in hook #{index}: {source}")]
pub struct HookError {
    pub stage: String,
    pub index: usize,
    #[source]
    pub source: anyhow::Error,
}

type Hook<A> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Named hook stages. Hooks of a stage run one after the other in
/// registration order; the first failure ends the run.
pub struct LifecycleRegistry<A = Option<Socket>> {
    stages: DashMap<String, Vec<Hook<A>>>,
}

impl<A> Default for LifecycleRegistry<A> {
    fn default() -> Self {
        Self {
            stages: DashMap::new(),
        }
    }
}

impl<A> LifecycleRegistry<A>
where
    A: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `hook` to `stage`.
    pub fn bind<F, Fut>(&self, stage: impl Into<String>, hook: F) -> &Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let hook: Hook<A> = Arc::new(move |args| hook(args).boxed());
        self.stages.entry(stage.into()).or_default().push(hook);
        self
    }

    /// Like [`bind`](Self::bind), but a `None` hook is ignored, so call sites
    /// can register conditionally.
    pub fn bind_optional<F, Fut>(&self, stage: impl Into<String>, hook: Option<F>) -> &Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match hook {
            Some(hook) => self.bind(stage, hook),
            None => self,
        }
    }

    pub fn len(&self, stage: &str) -> usize {
        self.stages.get(stage).map(|h| h.len()).unwrap_or(0)
    }

    /// Run every hook of `stage` in order, waiting for each before starting
    /// the next. A stage without hooks is a no-op.
    pub async fn trigger(&self, stage: &str, args: A) -> Result<(), HookError> {
        // Snapshot so no map guard is held across an await.
        let hooks: Vec<Hook<A>> = match self.stages.get(stage) {
            Some(hooks) => hooks.clone(),
            None => return Ok(()),
        };
        debug!(%stage, hooks = hooks.len(), "trigger");

        for (index, hook) in hooks.iter().enumerate() {
            hook(args.clone()).await.map_err(|source| HookError {
                stage: stage.to_string(),
                index,
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn hooks_run_in_order_and_stop_at_first_failure() {
        let registry: LifecycleRegistry<()> = LifecycleRegistry::new();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let r = Arc::clone(&ran);
        registry.bind("start", move |_| {
            let r = Arc::clone(&r);
            async move {
                r.lock().unwrap().push(1);
                Ok(())
            }
        });
        let r = Arc::clone(&ran);
        registry.bind("start", move |_| {
            let r = Arc::clone(&r);
            async move {
                r.lock().unwrap().push(2);
                anyhow::bail!("second hook failed")
            }
        });
        let r = Arc::clone(&ran);
        registry.bind("start", move |_| {
            let r = Arc::clone(&r);
            async move {
                r.lock().unwrap().push(3);
                Ok(())
            }
        });

        let err = registry.trigger("start", ()).await.unwrap_err();
        assert_eq!(err.stage, "start");
        assert_eq!(err.index, 1);
        assert_eq!(*ran.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn hooks_are_sequential() {
        let registry: LifecycleRegistry<()> = LifecycleRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = Arc::clone(&log);
        registry.bind("open", move |_| {
            let l = Arc::clone(&l);
            async move {
                l.lock().unwrap().push("slow:start");
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                l.lock().unwrap().push("slow:end");
                Ok(())
            }
        });
        let l = Arc::clone(&log);
        registry.bind("open", move |_| {
            let l = Arc::clone(&l);
            async move {
                l.lock().unwrap().push("fast");
                Ok(())
            }
        });

        registry.trigger("open", ()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["slow:start", "slow:end", "fast"]);
    }

    #[tokio::test]
    async fn empty_stage_and_optional_hooks() {
        let registry: LifecycleRegistry<u32> = LifecycleRegistry::new();
        registry.trigger("nothing", 1).await.unwrap();

        let none: Option<fn(u32) -> std::future::Ready<anyhow::Result<()>>> = None;
        registry.bind_optional("stop", none);
        assert_eq!(registry.len("stop"), 0);

        registry.bind_optional("stop", Some(|n: u32| async move {
            anyhow::ensure!(n == 7, "unexpected argument {n}");
            Ok(())
        }));
        assert_eq!(registry.len("stop"), 1);
        registry.trigger("stop", 7).await.unwrap();
    }

    #[tokio::test]
    async fn stages_fail_independently() {
        let registry: LifecycleRegistry<()> = LifecycleRegistry::new();
        registry.bind("a", |_| async { anyhow::bail!("a broke") });
        registry.bind("b", |_| async { Ok(()) });

        assert!(registry.trigger("a", ()).await.is_err());
        registry.trigger("b", ()).await.unwrap();
    }
}
