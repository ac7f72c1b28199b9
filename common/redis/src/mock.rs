use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Client, CustomRedisError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub args: Vec<String>,
}

#[derive(Default)]
struct MockState {
    sorted_sets: HashMap<String, HashMap<String, i64>>,
    hashes: HashMap<String, HashMap<String, String>>,
    failure: Option<CustomRedisError>,
    calls: Vec<MockRedisCall>,
}

/// In-memory stand-in for a redis server, with the sorted set and hash
/// semantics of the commands in [`Client`]. Clones share the same state.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every following call fail with `err`, until `clear_failure`.
    pub fn fail_with(&self, err: CustomRedisError) {
        self.lock().failure = Some(err);
    }

    pub fn clear_failure(&self) {
        self.lock().failure = None;
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock().calls.clone()
    }

    /// Current members of a sorted set, lowest score first.
    pub fn members(&self, key: &str) -> Vec<(String, i64)> {
        let state = self.lock();
        state
            .sorted_sets
            .get(key)
            .map(sorted_members)
            .unwrap_or_default()
    }

    fn begin(
        &self,
        op: &str,
        key: &str,
        args: &[&str],
    ) -> Result<MutexGuard<'_, MockState>, CustomRedisError> {
        let mut state = self.lock();
        state.calls.push(MockRedisCall {
            op: op.to_string(),
            key: key.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        });
        if let Some(err) = state.failure.clone() {
            return Err(err);
        }
        Ok(state)
    }
}

fn sorted_members(set: &HashMap<String, i64>) -> Vec<(String, i64)> {
    let mut members: Vec<(String, i64)> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

#[async_trait]
impl Client for MockRedisClient {
    async fn zadd_nx(
        &self,
        k: String,
        member: String,
        score: i64,
    ) -> Result<bool, CustomRedisError> {
        let mut state = self.begin("zadd_nx", &k, &[&member, &score.to_string()])?;
        let set = state.sorted_sets.entry(k).or_default();
        if set.contains_key(&member) {
            return Ok(false);
        }
        set.insert(member, score);
        Ok(true)
    }

    async fn zadd_gt(&self, k: String, member: String, score: i64) -> Result<(), CustomRedisError> {
        let mut state = self.begin("zadd_gt", &k, &[&member, &score.to_string()])?;
        let set = state.sorted_sets.entry(k).or_default();
        let current = set.entry(member).or_insert(score);
        if score > *current {
            *current = score;
        }
        Ok(())
    }

    async fn zpopmin(&self, k: String, count: u64) -> Result<Vec<(String, i64)>, CustomRedisError> {
        let mut state = self.begin("zpopmin", &k, &[&count.to_string()])?;
        let Some(set) = state.sorted_sets.get_mut(&k) else {
            return Ok(vec![]);
        };
        let popped: Vec<(String, i64)> = sorted_members(set)
            .into_iter()
            .take(count as usize)
            .collect();
        for (member, _) in &popped {
            set.remove(member);
        }
        Ok(popped)
    }

    async fn zcard(&self, k: String) -> Result<u64, CustomRedisError> {
        let state = self.begin("zcard", &k, &[])?;
        Ok(state.sorted_sets.get(&k).map_or(0, |s| s.len() as u64))
    }

    async fn zscore(&self, k: String, member: String) -> Result<Option<i64>, CustomRedisError> {
        let state = self.begin("zscore", &k, &[&member])?;
        Ok(state
            .sorted_sets
            .get(&k)
            .and_then(|s| s.get(&member))
            .copied())
    }

    async fn hset_nx(
        &self,
        k: String,
        field: String,
        v: String,
    ) -> Result<bool, CustomRedisError> {
        let mut state = self.begin("hset_nx", &k, &[&field, &v])?;
        let hash = state.hashes.entry(k).or_default();
        if hash.contains_key(&field) {
            return Ok(false);
        }
        hash.insert(field, v);
        Ok(true)
    }

    async fn hget(&self, k: String, field: String) -> Result<String, CustomRedisError> {
        let state = self.begin("hget", &k, &[&field])?;
        state
            .hashes
            .get(&k)
            .and_then(|h| h.get(&field))
            .cloned()
            .ok_or(CustomRedisError::NotFound)
    }

    async fn hdel(&self, k: String, field: String) -> Result<(), CustomRedisError> {
        let mut state = self.begin("hdel", &k, &[&field])?;
        if let Some(hash) = state.hashes.get_mut(&k) {
            hash.remove(&field);
        }
        Ok(())
    }
}
