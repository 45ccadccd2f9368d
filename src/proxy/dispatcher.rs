use hyper::{Request, Response};
use tracing::{info, warn};

use crate::common::{LoadBalancerError, ProxyBody};
use crate::proxy::backend::Upstream;
use crate::selection_method::RoundRobin;

/// Routes every request to exactly one upstream, rotating through the
/// targets in configuration order.
#[derive(Debug)]
pub struct Dispatcher<U> {
    targets: Vec<U>,
    cursor: RoundRobin,
}

impl<U: Upstream> Dispatcher<U> {
    pub fn new(targets: Vec<U>) -> Result<Self, LoadBalancerError> {
        if targets.is_empty() {
            return Err(LoadBalancerError::NoTargets);
        }

        Ok(Self {
            targets,
            cursor: RoundRobin::new(),
        })
    }

    pub fn targets(&self) -> &[U] {
        &self.targets
    }

    /// Picks the next live target in rotation order.
    ///
    /// Every examined candidate consumes one cursor position, live or not.
    ///
    /// # Hazard
    ///
    /// If no target is live this never returns: it keeps rotating until one
    /// becomes live again. Nothing currently marks a [`Backend`] as down, so
    /// the loop only spins when an [`Upstream`] implementation reports every
    /// target dead at once.
    ///
    /// [`Backend`]: crate::proxy::backend::Backend
    pub fn select_next(&self) -> &U {
        let mut examined = 0usize;
        loop {
            let target = &self.targets[self.cursor.next() % self.targets.len()];
            if target.is_live() {
                return target;
            }

            examined += 1;
            if examined == self.targets.len() {
                warn!(
                    targets = self.targets.len(),
                    "No live upstream target, still rotating"
                );
            }
            std::hint::spin_loop();
        }
    }

    /// Forwards `req` to the next target and returns its outcome unchanged.
    /// There is no retry against another target.
    pub async fn dispatch(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, LoadBalancerError> {
        let target = self.select_next();
        info!(upstream = target.address(), "Forwarding request");
        target.forward(req).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use hyper::StatusCode;

    use super::*;
    use crate::common::types::{empty, full};

    #[derive(Debug)]
    struct MockTarget {
        name: String,
        live: AtomicBool,
        fail: bool,
        calls: AtomicUsize,
    }

    impl MockTarget {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                live: AtomicBool::new(true),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn dead(name: &str) -> Self {
            let target = Self::new(name);
            target.live.store(false, Ordering::Relaxed);
            target
        }

        fn failing(name: &str) -> Self {
            Self {
                fail: true,
                ..Self::new(name)
            }
        }
    }

    impl Upstream for MockTarget {
        fn address(&self) -> &str {
            &self.name
        }

        fn is_live(&self) -> bool {
            self.live.load(Ordering::Relaxed)
        }

        fn forward(
            &self,
            _req: Request<ProxyBody>,
        ) -> impl Future<Output = Result<Response<ProxyBody>, LoadBalancerError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail {
                Err(LoadBalancerError::InvalidAddress {
                    addr: self.name.clone(),
                    reason: "unreachable".into(),
                })
            } else {
                Ok(Response::new(full(self.name.clone())))
            };
            async move { result }
        }
    }

    fn names(dispatcher: &Dispatcher<MockTarget>, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| dispatcher.select_next().address().to_string())
            .collect()
    }

    fn request() -> Request<ProxyBody> {
        Request::new(empty())
    }

    #[test]
    fn empty_target_list_is_rejected() {
        let result = Dispatcher::<MockTarget>::new(vec![]);
        assert!(matches!(result, Err(LoadBalancerError::NoTargets)));
    }

    #[test]
    fn rotates_in_configuration_order() {
        let dispatcher = Dispatcher::new(vec![
            MockTarget::new("A"),
            MockTarget::new("B"),
            MockTarget::new("C"),
        ])
        .unwrap();

        assert_eq!(names(&dispatcher, 6), ["A", "B", "C", "A", "B", "C"]);
    }

    #[test]
    fn kth_call_returns_index_k_minus_one_mod_n() {
        let targets: Vec<_> = (0..5).map(|i| MockTarget::new(&i.to_string())).collect();
        let dispatcher = Dispatcher::new(targets).unwrap();

        for k in 1..=23usize {
            let expected = ((k - 1) % 5).to_string();
            assert_eq!(dispatcher.select_next().address(), expected);
        }
    }

    #[test]
    fn sequence_is_deterministic() {
        let build = || {
            Dispatcher::new(vec![
                MockTarget::new("A"),
                MockTarget::new("B"),
                MockTarget::dead("C"),
                MockTarget::new("D"),
            ])
            .unwrap()
        };

        assert_eq!(names(&build(), 20), names(&build(), 20));
    }

    #[test]
    fn skips_targets_that_are_not_live() {
        let dispatcher = Dispatcher::new(vec![
            MockTarget::new("A"),
            MockTarget::dead("B"),
            MockTarget::new("C"),
        ])
        .unwrap();

        assert_eq!(names(&dispatcher, 4), ["A", "C", "A", "C"]);
    }

    #[test]
    fn skipped_targets_still_consume_the_cursor() {
        let dispatcher = Dispatcher::new(vec![
            MockTarget::new("A"),
            MockTarget::dead("B"),
            MockTarget::new("C"),
        ])
        .unwrap();

        dispatcher.select_next();
        dispatcher.select_next();
        assert_eq!(dispatcher.cursor.position(), 3);
    }

    #[test]
    fn concurrent_selection_loses_no_updates() {
        let dispatcher = Arc::new(
            Dispatcher::new(vec![
                MockTarget::new("A"),
                MockTarget::new("B"),
                MockTarget::new("C"),
                MockTarget::new("D"),
            ])
            .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || names(&dispatcher, 1000))
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for name in handle.join().unwrap() {
                *counts.entry(name).or_default() += 1;
            }
        }

        assert_eq!(dispatcher.cursor.position(), 8000);
        for name in ["A", "B", "C", "D"] {
            assert_eq!(counts[name], 2000, "uneven share for {name}");
        }
    }

    #[test]
    fn keeps_rotating_until_a_target_comes_back() {
        let dispatcher =
            Arc::new(Dispatcher::new(vec![MockTarget::dead("A"), MockTarget::dead("B")]).unwrap());

        let selector = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.select_next().address().to_string())
        };

        while dispatcher.cursor.position() < 100 {
            thread::yield_now();
        }
        dispatcher.targets()[1].live.store(true, Ordering::Relaxed);

        assert_eq!(selector.join().unwrap(), "B");
        assert!(dispatcher.cursor.position() > 100);
    }

    #[tokio::test]
    async fn dispatch_returns_the_chosen_targets_response() {
        let dispatcher = Dispatcher::new(vec![MockTarget::new("A"), MockTarget::new("B")]).unwrap();

        let first = dispatcher.dispatch(request()).await.unwrap();
        let second = dispatcher.dispatch(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);

        assert_eq!(dispatcher.targets()[0].calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.targets()[1].calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_forward_is_not_retried_elsewhere() {
        let dispatcher = Dispatcher::new(vec![
            MockTarget::failing("A"),
            MockTarget::new("B"),
            MockTarget::new("C"),
        ])
        .unwrap();

        let result = dispatcher.dispatch(request()).await;
        assert!(result.is_err());

        let calls: Vec<_> = dispatcher
            .targets()
            .iter()
            .map(|t| t.calls.load(Ordering::SeqCst))
            .collect();
        assert_eq!(calls, [1, 0, 0]);
    }
}
