use crate::{Result, error::Error, value};
use dashmap::DashMap;
use indexmap::IndexSet;
use itertools::Itertools;
use serde_json::{Value, json};

#[derive(Debug, Default)]
struct MutationState {
    generation: u64,
    readers: IndexSet<String>,
    mutator: Option<String>,
}

/// Process-wide registry of which jobs are reading or mutating each file
/// location. It does not wait: conflicting registrations fail synchronously
/// and the workflow scheduler is responsible for never dispatching
/// conflicting jobs concurrently.
#[derive(Debug, Default)]
pub struct MutationManager {
    state: DashMap<String, MutationState>,
}

impl MutationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_reader(&self, job: &str, obj: &Value) -> Result<()> {
        let loc = value::location_of(obj)?.to_string();
        let generation = descriptor_generation(obj);
        let mut st = self.state.entry(loc.clone()).or_default();
        if generation != st.generation {
            return Err(Error::workflow(format!(
                "[job {job}] wants to read {loc} at generation {generation} but current generation is {}",
                st.generation
            )));
        }
        if let Some(mutator) = &st.mutator {
            return Err(Error::workflow(format!(
                "[job {job}] wants to read {loc} but it is being modified by [job {mutator}]"
            )));
        }
        st.readers.insert(job.to_string());
        Ok(())
    }

    pub fn register_mutation(&self, job: &str, obj: &Value) -> Result<()> {
        let loc = value::location_of(obj)?.to_string();
        let generation = descriptor_generation(obj);
        let mut st = self.state.entry(loc.clone()).or_default();
        if generation != st.generation {
            return Err(Error::workflow(format!(
                "[job {job}] wants to modify {loc} at generation {generation} but current generation is {}",
                st.generation
            )));
        }
        if !st.readers.is_empty() {
            let readers = st.readers.iter().join(", ");
            return Err(Error::workflow(format!(
                "[job {job}] wants to modify {loc} but it has readers: {readers}"
            )));
        }
        if let Some(mutator) = &st.mutator {
            return Err(Error::workflow(format!(
                "[job {job}] wants to modify {loc} but it is already being modified by [job {mutator}]"
            )));
        }
        st.generation += 1;
        st.mutator = Some(job.to_string());
        Ok(())
    }

    pub fn release_reader(&self, job: &str, obj: &Value) -> Result<()> {
        let loc = value::location_of(obj)?;
        if let Some(mut st) = self.state.get_mut(loc) {
            st.readers.shift_remove(job);
        }
        Ok(())
    }

    /// Stamp the descriptor with the location's current generation so
    /// downstream consumers see a coherent version.
    pub fn set_generation(&self, obj: &mut Value) -> Result<()> {
        let loc = value::location_of(obj)?.to_string();
        let generation = self
            .state
            .get(&loc)
            .map(|st| st.generation)
            .unwrap_or_default();
        obj["_generation"] = json!(generation);
        Ok(())
    }
}

fn descriptor_generation(obj: &Value) -> u64 {
    obj.get("_generation").and_then(|g| g.as_u64()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(loc: &str) -> Value {
        json!({"class": "File", "location": loc})
    }

    #[test]
    fn readers_block_mutations() {
        let mm = MutationManager::new();
        let f = file("file:///d/a.txt");
        mm.register_reader("job1", &f).unwrap();
        mm.register_reader("job2", &f).unwrap();
        assert!(mm.register_mutation("job3", &f).is_err());
        mm.release_reader("job1", &f).unwrap();
        assert!(mm.register_mutation("job3", &f).is_err());
        mm.release_reader("job2", &f).unwrap();
        mm.register_mutation("job3", &f).unwrap();
    }

    #[test]
    fn mutator_blocks_readers_and_other_mutators() {
        let mm = MutationManager::new();
        let mut f = file("file:///d/b.txt");
        mm.register_mutation("writer", &f).unwrap();
        assert!(mm.register_reader("reader", &f).is_err());
        assert!(mm.register_mutation("writer2", &f).is_err());
        // A descriptor stamped with the new generation is coherent again.
        mm.set_generation(&mut f).unwrap();
        assert_eq!(f["_generation"], 1);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let mm = MutationManager::new();
        let f = file("file:///d/c.txt");
        mm.register_mutation("writer", &f).unwrap();
        // The un-stamped descriptor still claims generation 0.
        let err = mm.register_reader("reader", &f).unwrap_err();
        assert!(err.to_string().contains("generation"));
    }
}
