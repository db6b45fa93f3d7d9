//! Virtual-host routing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::access::AccessControl;
use crate::backend::Destination;
use crate::config::Target;
use crate::error::Result;
use crate::pool::Pool;

/// What a Host value routes to: the target's backend pool and its
/// access-control policy.
#[derive(Debug, Clone)]
pub struct Route {
    pool: Arc<Pool>,
    access: Arc<AccessControl>,
}

impl Route {
    /// The backend pool serving this route.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// The pre-dispatch client filter for this route.
    pub fn access(&self) -> &AccessControl {
        &self.access
    }
}

/// Immutable mapping from Host header values to routes.
///
/// Built once from configuration; every request task reads it without
/// synchronization. A lookup tries the Host value verbatim first and
/// falls back to the bare hostname with any `:port` suffix stripped.
pub struct Router {
    routes: HashMap<String, Route>,
    /// One entry per target, for startup connect scheduling; hosts of a
    /// target share the pool.
    pools: Vec<Arc<Pool>>,
}

impl Router {
    /// Builds the router from the configured targets.
    pub fn from_targets(targets: &[Target]) -> Result<Router> {
        let mut routes = HashMap::new();
        let mut pools = Vec::with_capacity(targets.len());

        for target in targets {
            let destinations = target
                .backends
                .iter()
                .map(|spec| Destination::parse(spec))
                .collect::<Result<Vec<_>>>()?;
            let pool = Arc::new(Pool::new(destinations));
            let access = Arc::new(match &target.access {
                Some(policy) => AccessControl::from_policy(policy)?,
                None => AccessControl::allow_all(),
            });

            for host in &target.hosts {
                routes.insert(
                    host.clone(),
                    Route {
                        pool: Arc::clone(&pool),
                        access: Arc::clone(&access),
                    },
                );
            }
            pools.push(pool);
        }

        Ok(Router { routes, pools })
    }

    /// Looks up the route for a Host header value.
    pub fn route(&self, host: &str) -> Option<&Route> {
        if let Some(route) = self.routes.get(host) {
            return Some(route);
        }
        self.routes.get(strip_port(host))
    }

    /// Schedules the initial connect on every slot of every pool.
    pub fn connect_all(&self) {
        for pool in &self.pools {
            pool.connect_all();
        }
    }

    /// Every target pool, in configuration order.
    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Router")
            .field("hosts", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Strips a trailing `:port` from a Host value, leaving IPv6 literals
/// (`[::1]:8080` and bare `[::1]`) intact.
fn strip_port(host: &str) -> &str {
    if let Some(bracket_end) = host.rfind(']') {
        // IPv6 literal; a port can only follow the closing bracket.
        return &host[..=bracket_end];
    }
    match host.rsplit_once(':') {
        Some((bare, _port)) => bare,
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn router() -> Router {
        let config = Config::parse(
            r#"
            [[listener]]
            port = 0

            [[target]]
            hosts = ["a.example", "b.example"]
            backends = ["127.0.0.1:9000"]

            [[target]]
            hosts = ["[::1]"]
            backends = ["127.0.0.1:9001"]
        "#,
        )
        .unwrap();
        Router::from_targets(&config.targets).unwrap()
    }

    #[test]
    fn verbatim_match_wins() {
        let router = router();
        assert!(router.route("a.example").is_some());
        assert!(router.route("b.example").is_some());
        assert!(router.route("c.example").is_none());
    }

    #[test]
    fn port_suffix_falls_back_to_bare_host() {
        let router = router();
        assert!(router.route("a.example:8080").is_some());
        assert!(router.route("a.example:443").is_some());
        assert!(router.route("c.example:8080").is_none());
    }

    #[test]
    fn ipv6_literals_strip_only_the_port() {
        let router = router();
        assert!(router.route("[::1]").is_some());
        assert!(router.route("[::1]:8080").is_some());
        assert!(router.route("[::2]:8080").is_none());
    }

    #[test]
    fn hosts_of_one_target_share_a_pool() {
        let router = router();
        let a = router.route("a.example").unwrap();
        let b = router.route("b.example").unwrap();
        assert!(Arc::ptr_eq(a.pool(), b.pool()));
    }

    #[test]
    fn pools_lists_one_per_target() {
        let router = router();
        assert_eq!(router.pools().len(), 2);
    }
}
