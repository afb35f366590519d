//! Enrolled population and threshold-based enrollment.

use crate::types::{EnrolledIdentity, MatchPolicy, MatchResult, Matcher};

/// Key-value store of enrolled identities.
///
/// Matching reads `get_all`; enrollment mutates through `add`/`delete`.
/// Callers serialize writers against readers.
pub trait Population {
    fn add(&mut self, identity: EnrolledIdentity);
    /// Insert at `index` (clamped to the end), shifting later records back.
    fn insert(&mut self, index: usize, identity: EnrolledIdentity);
    /// Remove by id. Returns `false` if no such identity exists.
    fn delete(&mut self, id: &str) -> bool;
    fn get_all(&self) -> &[EnrolledIdentity];
}

/// In-memory population, in enrollment order.
#[derive(Debug, Clone, Default)]
pub struct MemoryPopulation {
    identities: Vec<EnrolledIdentity>,
}

impl MemoryPopulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_identities(identities: Vec<EnrolledIdentity>) -> Self {
        Self { identities }
    }

    pub fn get(&self, id: &str) -> Option<&EnrolledIdentity> {
        self.identities.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl Population for MemoryPopulation {
    fn add(&mut self, identity: EnrolledIdentity) {
        self.identities.push(identity);
    }

    fn insert(&mut self, index: usize, identity: EnrolledIdentity) {
        let index = index.min(self.identities.len());
        self.identities.insert(index, identity);
    }

    fn delete(&mut self, id: &str) -> bool {
        let before = self.identities.len();
        self.identities.retain(|i| i.id != id);
        self.identities.len() != before
    }

    fn get_all(&self) -> &[EnrolledIdentity] {
        &self.identities
    }
}

/// Result of [`enroll`].
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub identity: EnrolledIdentity,
    /// The prior record this enrollment replaced, if any.
    pub replaced: Option<EnrolledIdentity>,
    /// Position the replaced record held in the population.
    pub replaced_index: Option<usize>,
    /// Best match of the new descriptor against the population before enrollment.
    pub best_match: MatchResult,
}

/// Enroll `identity`, first deleting the best existing match if it scores
/// above the dedup threshold. Re-enrolling the same face keeps one record.
pub fn enroll<P, M>(
    population: &mut P,
    identity: EnrolledIdentity,
    matcher: &M,
    policy: &MatchPolicy,
) -> EnrollOutcome
where
    P: Population + ?Sized,
    M: Matcher + ?Sized,
{
    let best = matcher.best_match(&identity.descriptor, population.get_all());

    let mut replaced = None;
    let mut replaced_index = None;
    if policy.is_duplicate(&best) {
        if let Some(id) = best.identity_id.as_deref() {
            replaced_index = population.get_all().iter().position(|i| i.id == id);
            replaced = replaced_index.map(|idx| population.get_all()[idx].clone());
            population.delete(id);
            tracing::info!(
                replaced_id = id,
                replaced_name = best.label(),
                score = best.score,
                "re-enrollment replaces existing identity"
            );
        }
    }

    tracing::info!(id = %identity.id, name = %identity.name, "identity enrolled");
    population.add(identity.clone());

    EnrollOutcome {
        identity,
        replaced,
        replaced_index,
        best_match: best,
    }
}

/// Undo an [`enroll`]: drop the new record and put the replaced one back
/// at its former position, so first-seen tie-breaking is unchanged.
pub fn revert_enroll<P>(population: &mut P, outcome: &EnrollOutcome)
where
    P: Population + ?Sized,
{
    population.delete(&outcome.identity.id);
    if let (Some(previous), Some(index)) = (&outcome.replaced, outcome.replaced_index) {
        population.insert(index, previous.clone());
    }
    tracing::info!(id = %outcome.identity.id, "enrollment reverted");
}
