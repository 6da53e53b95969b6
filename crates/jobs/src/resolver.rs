//! Dependency resolution: which queued jobs may run, which are doomed by a
//! failed prerequisite, and which sit in an unresolvable cycle.
//!
//! Readiness is a derived view of persisted statuses. Views are cached per
//! batch and patched incrementally as jobs complete; they are rebuilt when a
//! candidate is unknown to the view or the view outlives `readiness_ttl`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use tidepool_core::BatchId;

use crate::store::{CancelOutcome, JobStore, JobStoreError};
use crate::types::{FailureClass, Job, JobError, JobId, JobStatus};

/// Cache key for a readiness view. Unbatched jobs share the `None` view.
pub type BatchKey = Option<BatchId>;

/// Outcome of one resolution pass, in candidate order.
#[derive(Debug, Default, Clone)]
pub struct Resolution {
    /// Every dependency is done
    pub ready: Vec<JobId>,
    /// A dependency ended in error or cancellation (or vanished)
    pub doomed: Vec<(JobId, JobError)>,
    /// Part of, or downstream of, a dependency cycle
    pub stuck: Vec<JobId>,
}

#[derive(Debug, Default)]
struct Node {
    /// Dependencies not yet done
    blocking: BTreeSet<JobId>,
    doomed: Option<JobError>,
    stuck: bool,
}

#[derive(Debug)]
struct BatchView {
    built_at: Instant,
    nodes: HashMap<JobId, Node>,
}

impl BatchView {
    fn stuck(&self) -> impl Iterator<Item = JobId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, node)| node.stuck)
            .map(|(id, _)| *id)
    }
}

/// Per-batch readiness cache with a reverse dependency index.
#[derive(Debug)]
pub struct DependencyResolver {
    views: HashMap<BatchKey, BatchView>,
    /// dependency -> cached jobs waiting on it
    waiting_on: HashMap<JobId, HashSet<JobId>>,
    /// cached job -> the view holding it
    membership: HashMap<JobId, BatchKey>,
    readiness_ttl: Duration,
}

impl DependencyResolver {
    pub fn new(readiness_ttl: Duration) -> Self {
        Self {
            views: HashMap::new(),
            waiting_on: HashMap::new(),
            membership: HashMap::new(),
            readiness_ttl,
        }
    }

    pub fn readiness_ttl(&self) -> Duration {
        self.readiness_ttl
    }

    /// Classify candidates (queued jobs, in claim order).
    pub fn resolve<S: JobStore + ?Sized>(
        &mut self,
        store: &S,
        candidates: &[Job],
        now: Instant,
    ) -> Result<Resolution, JobStoreError> {
        let mut resolution = Resolution::default();
        let mut refreshed: HashSet<BatchKey> = HashSet::new();

        for job in candidates {
            if job.depends_on.is_empty() {
                resolution.ready.push(job.id);
                continue;
            }

            let key = job.batch_id;
            let stale = match self.views.get(&key) {
                None => true,
                Some(view) => {
                    !view.nodes.contains_key(&job.id)
                        || now.duration_since(view.built_at) >= self.readiness_ttl
                }
            };
            if stale && refreshed.insert(key) {
                let seeds: Vec<&Job> = candidates
                    .iter()
                    .filter(|c| c.batch_id == key && !c.depends_on.is_empty())
                    .collect();
                self.build_view(store, key, &seeds, now)?;
            }

            let Some(node) = self.views.get(&key).and_then(|v| v.nodes.get(&job.id)) else {
                continue;
            };
            if let Some(reason) = &node.doomed {
                resolution.doomed.push((job.id, reason.clone()));
            } else if node.stuck {
                resolution.stuck.push(job.id);
            } else if node.blocking.is_empty() {
                resolution.ready.push(job.id);
            }
        }

        Ok(resolution)
    }

    /// Jobs currently known to be stuck in a dependency cycle, across all views.
    pub fn stuck_jobs(&self) -> BTreeSet<JobId> {
        self.views.values().flat_map(BatchView::stuck).collect()
    }

    /// A claimed job is no longer a candidate: drop its node.
    ///
    /// Its dependents stay registered as waiting on it, so `on_completed`
    /// still unblocks them. A job released back to the queue is picked up
    /// again by the next rebuild.
    pub fn on_claimed(&mut self, job_id: JobId) {
        self.evict(job_id);
    }

    /// A job reached `done`: unblock everything waiting on it.
    pub fn on_completed(&mut self, job_id: JobId) {
        if let Some(waiters) = self.waiting_on.remove(&job_id) {
            for waiter in waiters {
                let Some(key) = self.membership.get(&waiter) else {
                    continue;
                };
                if let Some(node) = self
                    .views
                    .get_mut(key)
                    .and_then(|view| view.nodes.get_mut(&waiter))
                {
                    node.blocking.remove(&job_id);
                }
            }
        }
        self.evict(job_id);
    }

    /// A job reached `error` or `cancelled`: doom everything waiting on it and evict it.
    pub fn on_terminal(&mut self, job_id: JobId) {
        if let Some(waiters) = self.waiting_on.remove(&job_id) {
            for waiter in waiters {
                let Some(key) = self.membership.get(&waiter) else {
                    continue;
                };
                if let Some(node) = self
                    .views
                    .get_mut(key)
                    .and_then(|view| view.nodes.get_mut(&waiter))
                {
                    node.doomed.get_or_insert_with(|| JobError::dependency_failed(job_id));
                }
            }
        }
        self.evict(job_id);
    }

    /// Drop a cached view so the next pass rebuilds it from the store.
    pub fn invalidate_batch(&mut self, key: BatchKey) {
        let Some(view) = self.views.remove(&key) else {
            return;
        };
        for id in view.nodes.keys() {
            self.membership.remove(id);
        }
        for waiters in self.waiting_on.values_mut() {
            waiters.retain(|id| !view.nodes.contains_key(id));
        }
        self.waiting_on.retain(|_, waiters| !waiters.is_empty());
    }

    fn evict(&mut self, job_id: JobId) {
        if let Some(key) = self.membership.remove(&job_id)
            && let Some(view) = self.views.get_mut(&key)
            && let Some(node) = view.nodes.remove(&job_id)
        {
            for dep in node.blocking {
                if let Some(waiters) = self.waiting_on.get_mut(&dep) {
                    waiters.remove(&job_id);
                    if waiters.is_empty() {
                        self.waiting_on.remove(&dep);
                    }
                }
            }
        }
    }

    /// Build the view for `key` from persisted statuses.
    ///
    /// Batched views hold every non-terminal job of the batch. The unbatched
    /// view starts from the given seeds and pulls in unbatched prerequisites.
    fn build_view<S: JobStore + ?Sized>(
        &mut self,
        store: &S,
        key: BatchKey,
        seeds: &[&Job],
        now: Instant,
    ) -> Result<(), JobStoreError> {
        // The unbatched view only sees one page of candidates at a time; keep
        // what earlier pages put there.
        let retained: Vec<JobId> = match key {
            None => self
                .views
                .get(&None)
                .map(|view| view.nodes.keys().copied().collect())
                .unwrap_or_default(),
            Some(_) => Vec::new(),
        };
        self.invalidate_batch(key);

        let mut members: HashMap<JobId, Job> = HashMap::new();
        match key {
            Some(batch_id) => {
                for job in store.batch_jobs(batch_id)? {
                    if !job.is_terminal() {
                        members.insert(job.id, job);
                    }
                }
            }
            None => {
                let mut frontier: VecDeque<Job> = seeds.iter().map(|j| (*j).clone()).collect();
                for id in retained {
                    if let Some(job) = store.get(id)?
                        && !job.is_terminal()
                    {
                        frontier.push_back(job);
                    }
                }
                while let Some(job) = frontier.pop_front() {
                    if members.contains_key(&job.id) {
                        continue;
                    }
                    for dep in &job.depends_on {
                        if members.contains_key(dep) {
                            continue;
                        }
                        if let Some(dep_job) = store.get(*dep)?
                            && dep_job.batch_id.is_none()
                            && !dep_job.is_terminal()
                        {
                            frontier.push_back(dep_job);
                        }
                    }
                    members.insert(job.id, job);
                }
            }
        }

        // Statuses of prerequisites outside the member set
        let external: Vec<JobId> = members
            .values()
            .flat_map(|j| j.depends_on.iter().copied())
            .filter(|dep| !members.contains_key(dep))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let statuses = store.dependency_statuses(&external)?;

        let mut nodes: HashMap<JobId, Node> = HashMap::with_capacity(members.len());
        for job in members.values() {
            let mut node = Node::default();
            for dep in &job.depends_on {
                let status = match members.get(dep) {
                    Some(member) => Some(member.status),
                    None => statuses.get(dep).copied(),
                };
                match status {
                    Some(JobStatus::Done) => {}
                    Some(status) if status.is_failure() => {
                        node.doomed
                            .get_or_insert_with(|| JobError::dependency_failed(*dep));
                    }
                    Some(_) => {
                        node.blocking.insert(*dep);
                    }
                    None => {
                        node.doomed.get_or_insert_with(|| {
                            JobError::new(
                                FailureClass::DependencyFailed,
                                format!("dependency {dep} not found"),
                            )
                        });
                    }
                }
            }
            nodes.insert(job.id, node);
        }

        // Kahn's algorithm over member-to-member edges; leftovers are cyclic or behind a cycle.
        let mut in_degree: HashMap<JobId, usize> = members
            .values()
            .map(|j| {
                let internal = j.depends_on.iter().filter(|d| members.contains_key(d)).count();
                (j.id, internal)
            })
            .collect();
        let mut internal_dependents: HashMap<JobId, Vec<JobId>> = HashMap::new();
        for job in members.values() {
            for dep in job.depends_on.iter().filter(|d| members.contains_key(d)) {
                internal_dependents.entry(*dep).or_default().push(job.id);
            }
        }
        let mut queue: VecDeque<JobId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        while let Some(id) = queue.pop_front() {
            for dependent in internal_dependents.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
            in_degree.remove(&id);
        }
        for id in in_degree.keys() {
            if let Some(node) = nodes.get_mut(id) {
                node.stuck = true;
            }
        }
        if !in_degree.is_empty() {
            warn!(
                batch_id = ?key,
                stuck = in_degree.len(),
                "dependency cycle detected; jobs will never become ready"
            );
        }

        for (id, node) in &nodes {
            self.membership.insert(*id, key);
            for dep in &node.blocking {
                self.waiting_on.entry(*dep).or_default().insert(*id);
            }
        }

        debug!(batch_id = ?key, jobs = nodes.len(), "readiness view built");
        self.views.insert(
            key,
            BatchView {
                built_at: now,
                nodes,
            },
        );
        Ok(())
    }
}

/// Cancel every non-terminal job downstream of `root`, breadth first.
///
/// Each dependent is cancelled at most once; the store's compare-and-swap
/// rejects a second attempt. Running dependents are flagged and cascade
/// further once their handlers return.
pub fn cascade_cancel<S: JobStore + ?Sized>(
    store: &S,
    root: JobId,
) -> Result<Vec<JobId>, JobStoreError> {
    let mut cancelled = Vec::new();
    let mut visited: HashSet<JobId> = HashSet::from([root]);
    let mut queue: VecDeque<JobId> = VecDeque::from([root]);

    while let Some(parent) = queue.pop_front() {
        for child in store.dependents(parent)? {
            if !visited.insert(child) {
                continue;
            }
            match store.mark_cancelled(child, JobError::dependency_failed(parent))? {
                CancelOutcome::Cancelled => {
                    debug!(job_id = %child, dependency = %parent, "cascade cancelled");
                    cancelled.push(child);
                    queue.push_back(child);
                }
                CancelOutcome::Requested => {
                    debug!(job_id = %child, dependency = %parent, "cascade requested cancellation of running job");
                }
                CancelOutcome::AlreadyTerminal | CancelOutcome::NotFound => {}
            }
        }
    }

    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use crate::types::{ClaimOrder, JobKind};
    use chrono::Utc;
    use tidepool_core::TenantId;

    fn job(tenant: TenantId, batch: Option<BatchId>) -> Job {
        let j = Job::new(tenant, JobKind::custom("test"), serde_json::json!({}));
        match batch {
            Some(b) => j.in_batch(b),
            None => j,
        }
    }

    fn candidates(store: &InMemoryJobStore) -> Vec<Job> {
        store.queued(Utc::now(), ClaimOrder::default(), None, 1000).unwrap()
    }

    fn finish(store: &InMemoryJobStore, id: JobId) {
        store.claim_ready(&[id], 1, ClaimOrder::default(), Utc::now()).unwrap();
        assert!(store.mark_done(id).unwrap());
    }

    #[test]
    fn independent_jobs_are_ready() {
        let store = InMemoryJobStore::new();
        let a = store.insert(job(TenantId::new(), None)).unwrap();

        let mut resolver = DependencyResolver::new(Duration::from_secs(30));
        let resolution = resolver.resolve(&store, &candidates(&store), Instant::now()).unwrap();
        assert_eq!(resolution.ready, vec![a]);
    }

    #[test]
    fn dependents_wait_then_become_ready_incrementally() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let batch = BatchId::new();
        let parent = store.insert(job(tenant, Some(batch))).unwrap();
        let child = store.insert(job(tenant, Some(batch)).depends_on([parent])).unwrap();

        let mut resolver = DependencyResolver::new(Duration::from_secs(30));
        let now = Instant::now();
        let resolution = resolver.resolve(&store, &candidates(&store), now).unwrap();
        assert_eq!(resolution.ready, vec![parent]);

        finish(&store, parent);
        resolver.on_completed(parent);

        let resolution = resolver.resolve(&store, &candidates(&store), now).unwrap();
        assert_eq!(resolution.ready, vec![child]);
    }

    #[test]
    fn failed_dependency_dooms_dependents() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let parent = store.insert(job(tenant, None)).unwrap();
        let child = store.insert(job(tenant, None).depends_on([parent])).unwrap();
        store.mark_cancelled(parent, JobError::cancelled("operator")).unwrap();

        let mut resolver = DependencyResolver::new(Duration::from_secs(30));
        let resolution = resolver.resolve(&store, &candidates(&store), Instant::now()).unwrap();

        assert!(resolution.ready.is_empty());
        assert_eq!(resolution.doomed.len(), 1);
        assert_eq!(resolution.doomed[0].0, child);
        assert_eq!(resolution.doomed[0].1.class, FailureClass::DependencyFailed);
    }

    #[test]
    fn cycles_are_stuck_not_ready() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let batch = BatchId::new();
        let mut a = job(tenant, Some(batch));
        let mut b = job(tenant, Some(batch));
        a.depends_on.insert(b.id);
        b.depends_on.insert(a.id);
        let (a_id, b_id) = (a.id, b.id);
        store.insert(a).unwrap();
        store.insert(b).unwrap();

        let mut resolver = DependencyResolver::new(Duration::from_secs(30));
        let resolution = resolver.resolve(&store, &candidates(&store), Instant::now()).unwrap();

        assert!(resolution.ready.is_empty());
        assert_eq!(resolution.stuck.len(), 2);
        assert_eq!(resolver.stuck_jobs(), BTreeSet::from([a_id, b_id]));
    }

    #[test]
    fn claimed_jobs_leave_the_view_but_still_unblock_dependents() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let batch = BatchId::new();
        let parent = store.insert(job(tenant, Some(batch))).unwrap();
        let child = store.insert(job(tenant, Some(batch)).depends_on([parent])).unwrap();

        let mut resolver = DependencyResolver::new(Duration::from_secs(30));
        let now = Instant::now();
        resolver.resolve(&store, &candidates(&store), now).unwrap();
        assert!(resolver.membership.contains_key(&parent));

        store.claim_ready(&[parent], 1, ClaimOrder::default(), Utc::now()).unwrap();
        resolver.on_claimed(parent);
        assert!(!resolver.membership.contains_key(&parent));
        assert!(resolver.waiting_on[&parent].contains(&child));

        assert!(store.mark_done(parent).unwrap());
        resolver.on_completed(parent);
        let resolution = resolver.resolve(&store, &candidates(&store), now).unwrap();
        assert_eq!(resolution.ready, vec![child]);
    }

    #[test]
    fn unbatched_view_accumulates_across_pages() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let parent = store.insert(job(tenant, None)).unwrap();
        let first = store.insert(job(tenant, None).depends_on([parent])).unwrap();
        let second = store.insert(job(tenant, None).depends_on([parent])).unwrap();

        let queued = candidates(&store);
        let (page_one, page_two): (Vec<Job>, Vec<Job>) =
            queued.into_iter().partition(|j| j.id != second);

        let mut resolver = DependencyResolver::new(Duration::from_secs(30));
        let now = Instant::now();
        assert_eq!(resolver.resolve(&store, &page_one, now).unwrap().ready, vec![parent]);
        assert!(resolver.resolve(&store, &page_two, now).unwrap().ready.is_empty());

        for id in [parent, first, second] {
            assert!(resolver.membership.contains_key(&id));
        }
    }

    #[test]
    fn stale_views_are_rebuilt() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let parent = store.insert(job(tenant, None)).unwrap();
        let child = store.insert(job(tenant, None).depends_on([parent])).unwrap();

        let ttl = Duration::from_millis(50);
        let mut resolver = DependencyResolver::new(ttl);
        let start = Instant::now();
        resolver.resolve(&store, &candidates(&store), start).unwrap();

        // Completed elsewhere; no completion event reaches this resolver.
        finish(&store, parent);

        let resolution = resolver.resolve(&store, &candidates(&store), start).unwrap();
        assert!(resolution.ready.is_empty());

        let resolution = resolver
            .resolve(&store, &candidates(&store), start + ttl)
            .unwrap();
        assert_eq!(resolution.ready, vec![child]);
    }

    #[test]
    fn cascade_cancels_transitive_dependents_once() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let root = store.insert(job(tenant, None)).unwrap();
        let left = store.insert(job(tenant, None).depends_on([root])).unwrap();
        let right = store.insert(job(tenant, None).depends_on([root])).unwrap();
        // Diamond: reachable through both branches
        let sink = store.insert(job(tenant, None).depends_on([left, right])).unwrap();

        let cancelled = cascade_cancel(&store, root).unwrap();
        assert_eq!(cancelled.len(), 3);
        assert_eq!(cancelled.iter().filter(|id| **id == sink).count(), 1);

        for id in [left, right, sink] {
            let j = store.get(id).unwrap().unwrap();
            assert_eq!(j.status, JobStatus::Cancelled);
            assert_eq!(j.last_error.unwrap().class, FailureClass::DependencyFailed);
        }

        // Second cascade is a no-op
        assert!(cascade_cancel(&store, root).unwrap().is_empty());
    }

    #[test]
    fn terminal_event_dooms_cached_waiters() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let batch = BatchId::new();
        let parent = store.insert(job(tenant, Some(batch))).unwrap();
        let child = store.insert(job(tenant, Some(batch)).depends_on([parent])).unwrap();

        let mut resolver = DependencyResolver::new(Duration::from_secs(30));
        let now = Instant::now();
        resolver.resolve(&store, &candidates(&store), now).unwrap();
        resolver.on_terminal(parent);

        let queued: Vec<Job> = candidates(&store).into_iter().filter(|j| j.id == child).collect();
        let resolution = resolver.resolve(&store, &queued, now).unwrap();
        assert_eq!(resolution.doomed.len(), 1);
        assert_eq!(resolution.doomed[0].0, child);
    }
}
