//! [`StatusReporter`]: HTML/JSON snapshots of queue depth, oldest-waiter
//! age, and per-host-type counts (§2, §9 "Observability").

use std::sync::Arc;

use crate::pool::Pool;
use crate::scheduler::Scheduler;

/// Reads snapshots from the scheduler and a fixed set of named pools and
/// renders them for an operator-facing status page.
///
/// Per §9, every snapshot is produced by taking each component's own lock
/// just long enough to copy values out; nothing here holds a lock across
/// another component's call.
pub struct StatusReporter {
    scheduler: Arc<Scheduler>,
    pools: Vec<(String, Arc<dyn Pool>)>,
}

impl StatusReporter {
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>, pools: Vec<(String, Arc<dyn Pool>)>) -> Self {
        Self { scheduler, pools }
    }

    /// Render an HTML fragment summarizing scheduler and pool state.
    #[must_use]
    pub fn html(&self) -> String {
        let mut out = String::from("<h1>buildlet scheduler status</h1>");

        out.push_str("<h2>waiters</h2><ul>");
        for host_type in &self.scheduler.state().host_types {
            out.push_str(&format!(
                "<li>{}: {} classes waiting, oldest {:?}, newest {:?}, last grant {:?} ago</li>",
                host_type.host_type,
                host_type.by_class.len(),
                host_type.oldest_waiter_age,
                host_type.newest_waiter_age,
                host_type.time_since_last_grant,
            ));
        }
        out.push_str("</ul>");

        out.push_str("<h2>pools</h2>");
        for (name, pool) in &self.pools {
            out.push_str(&format!("<h3>{name}</h3>"));
            out.push_str(&pool.html_status());

            for (dimension, stats) in pool.quota_stats() {
                if stats.waiters.is_empty() {
                    continue;
                }
                out.push_str(&format!("<p>{dimension} waiters (grant order):</p><ol>"));
                for w in &stats.waiters {
                    out.push_str(&format!(
                        "<li>{} cost {} (release branch: {})</li>",
                        w.class.as_str(),
                        w.cost,
                        w.release_branch,
                    ));
                }
                out.push_str("</ol>");
            }
        }
        out
    }

    /// Render the same snapshot as a `serde_json::Value`.
    #[cfg(feature = "serde")]
    #[must_use]
    pub fn json(&self) -> serde_json::Value {
        let snapshot = self.scheduler.state();
        let host_types: Vec<_> = snapshot
            .host_types
            .iter()
            .map(|h| {
                let by_class: serde_json::Map<String, serde_json::Value> = h
                    .by_class
                    .iter()
                    .map(|(class, count)| (class.as_str().to_string(), serde_json::json!(count)))
                    .collect();
                serde_json::json!({
                    "hostType": h.host_type,
                    "byClass": by_class,
                    "oldestWaiterAgeSecs": h.oldest_waiter_age.map(|d| d.as_secs_f64()),
                    "newestWaiterAgeSecs": h.newest_waiter_age.map(|d| d.as_secs_f64()),
                    "secsSinceLastGrant": h.time_since_last_grant.map(|d| d.as_secs_f64()),
                })
            })
            .collect();

        let pools: serde_json::Map<String, serde_json::Value> = self
            .pools
            .iter()
            .map(|(name, pool)| {
                let stats = pool
                    .quota_stats()
                    .into_iter()
                    .map(|(dimension, stats)| {
                        let waiters: Vec<serde_json::Value> = stats
                            .waiters
                            .iter()
                            .map(|w| {
                                serde_json::json!({
                                    "class": w.class.as_str(),
                                    "releaseBranch": w.release_branch,
                                    "sortTime": w.sort_time,
                                    "cost": w.cost,
                                })
                            })
                            .collect();
                        (
                            dimension,
                            serde_json::json!({
                                "limit": stats.limit,
                                "used": stats.used,
                                "untrackedUsed": stats.untracked_used,
                                "waiting": stats.waiting,
                                "waiters": waiters,
                            }),
                        )
                    })
                    .collect::<serde_json::Map<_, _>>();
                (name.clone(), serde_json::Value::Object(stats))
            })
            .collect();

        serde_json::json!({
            "hostTypes": host_types,
            "pools": pools,
        })
    }
}
