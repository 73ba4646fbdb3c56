//! External collaborators: the profile store and the persistence sink.
//!
//! These are the only points where the engine awaits. In-memory
//! implementations are provided for the CLI and for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::adaptation::AdaptationEvent;
use crate::aggregate::LoadWindow;
use crate::error::CollaboratorError;
use crate::models::{AthleteId, AthleteProfile, LoadSample};
use crate::training_plan::TrainingPlan;

/// Source of athlete profile snapshots
#[async_trait]
pub trait ProfileStore: Send + Sync + 'static {
    async fn fetch_profile(&self, athlete_id: &str) -> Result<AthleteProfile, CollaboratorError>;
}

/// Everything that changed for one athlete in one operation, written as a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub athlete_id: AthleteId,
    pub samples: Vec<LoadSample>,
    pub window: Option<LoadWindow>,
    pub plan: Option<TrainingPlan>,
    pub events: Vec<AdaptationEvent>,
}

impl StateUpdate {
    pub fn new(athlete_id: impl Into<AthleteId>) -> Self {
        StateUpdate {
            athlete_id: athlete_id.into(),
            samples: Vec::new(),
            window: None,
            plan: None,
            events: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.window.is_none() && self.plan.is_none() && self.events.is_empty()
    }
}

/// Outbound persistence. A failed commit must leave nothing written.
#[async_trait]
pub trait PersistenceSink: Send + Sync + 'static {
    async fn commit(&self, update: &StateUpdate) -> Result<(), CollaboratorError>;
}

/// Profile store backed by a map
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<AthleteId, AthleteProfile>>,
    fetches: AtomicUsize,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = AthleteProfile>) -> Self {
        let map = profiles
            .into_iter()
            .map(|p| (p.athlete_id.clone(), p))
            .collect();
        InMemoryProfileStore {
            profiles: RwLock::new(map),
            fetches: AtomicUsize::new(0),
        }
    }

    pub async fn upsert(&self, profile: AthleteProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.athlete_id.clone(), profile);
    }

    /// Number of fetches served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn fetch_profile(&self, athlete_id: &str) -> Result<AthleteProfile, CollaboratorError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.profiles
            .read()
            .await
            .get(athlete_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::ProfileNotFound(athlete_id.to_string()))
    }
}

/// Sink that keeps every committed update in memory
#[derive(Default)]
pub struct InMemorySink {
    updates: Mutex<Vec<StateUpdate>>,
    failure: Mutex<Option<CollaboratorError>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with `error`
    pub async fn fail_next(&self, error: CollaboratorError) {
        *self.failure.lock().await = Some(error);
    }

    pub async fn updates(&self) -> Vec<StateUpdate> {
        self.updates.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<AdaptationEvent> {
        self.updates
            .lock()
            .await
            .iter()
            .flat_map(|u| u.events.iter().cloned())
            .collect()
    }

    /// Most recently committed plan for an athlete
    pub async fn latest_plan(&self, athlete_id: &str) -> Option<TrainingPlan> {
        self.updates
            .lock()
            .await
            .iter()
            .rev()
            .filter(|u| u.athlete_id == athlete_id)
            .find_map(|u| u.plan.clone())
    }
}

#[async_trait]
impl PersistenceSink for InMemorySink {
    async fn commit(&self, update: &StateUpdate) -> Result<(), CollaboratorError> {
        if let Some(error) = self.failure.lock().await.take() {
            return Err(error);
        }
        self.updates.lock().await.push(update.clone());
        Ok(())
    }
}
