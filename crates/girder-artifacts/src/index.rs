//! In-memory bundle index and selection rules.

use girder_core::artifact::BundleRef;
use girder_core::definition::SelectionRule;
use girder_core::filters::BranchFilter;
use girder_core::ids::{BuildTypeId, RunId};
use girder_core::{Error, Result};

/// Published bundles, at most one per run.
#[derive(Debug, Default, Clone)]
pub struct BundleIndex {
    bundles: Vec<BundleRef>,
}

impl BundleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bundle, replacing any earlier bundle of the same run.
    pub fn insert(&mut self, bundle: BundleRef) {
        self.bundles.retain(|b| b.run_id != bundle.run_id);
        self.bundles.push(bundle);
    }

    pub fn get(&self, run_id: RunId) -> Option<&BundleRef> {
        self.bundles.iter().find(|b| b.run_id == run_id)
    }

    pub fn remove(&mut self, run_id: RunId) -> Option<BundleRef> {
        let position = self.bundles.iter().position(|b| b.run_id == run_id)?;
        Some(self.bundles.remove(position))
    }

    /// Set the pinned flag. Returns the updated bundle, if the run has one.
    pub fn set_pinned(&mut self, run_id: RunId, pinned: bool) -> Option<&BundleRef> {
        let bundle = self.bundles.iter_mut().find(|b| b.run_id == run_id)?;
        bundle.pinned = pinned;
        Some(bundle)
    }

    /// Pick the bundle `selection` names among bundles of `build_type`
    /// whose branch passes `branches`. Ties go to the highest run counter.
    pub fn select(
        &self,
        build_type: &BuildTypeId,
        selection: &SelectionRule,
        branches: &BranchFilter,
    ) -> Result<Option<BundleRef>> {
        let candidates = self
            .bundles
            .iter()
            .filter(|b| &b.build_type == build_type && branches.matches(&b.branch));

        let selected = match selection {
            SelectionRule::LastSuccessful => candidates.max_by_key(|b| b.run_counter),
            SelectionRule::LastPinned => candidates
                .filter(|b| b.pinned)
                .max_by_key(|b| b.run_counter),
            SelectionRule::BuildNumber { number } => candidates
                .filter(|b| &b.build_number == number)
                .max_by_key(|b| b.run_counter),
            SelectionRule::Run { run_id } => candidates
                .filter(|b| b.run_id == *run_id)
                .max_by_key(|b| b.run_counter),
            SelectionRule::SameChain => {
                return Err(Error::Internal(format!(
                    "same chain selection for {} must name a run",
                    build_type
                )));
            }
        };
        Ok(selected.cloned())
    }

    pub fn iter(&self) -> impl Iterator<Item = &BundleRef> {
        self.bundles.iter()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use girder_core::ids::BundleId;

    fn bundle(build_type: &str, counter: u64, branch: &str) -> BundleRef {
        BundleRef {
            id: BundleId::new(),
            build_type: build_type.into(),
            run_id: RunId::new(),
            run_counter: counter,
            build_number: format!("1.{counter}"),
            branch: branch.to_string(),
            pinned: false,
            entries: vec![],
            published_at: Utc::now(),
        }
    }

    fn index() -> (BundleIndex, Vec<RunId>) {
        let mut index = BundleIndex::new();
        let mut ids = Vec::new();
        for (counter, branch) in [(1, "main"), (2, "feature/x"), (3, "main"), (4, "feature/y")] {
            let b = bundle("Lib", counter, branch);
            ids.push(b.run_id);
            index.insert(b);
        }
        index.insert(bundle("App", 9, "main"));
        (index, ids)
    }

    #[test]
    fn test_last_successful_respects_branch_filter() {
        let (index, _) = index();
        let lib = BuildTypeId::from("Lib");

        let any = index
            .select(&lib, &SelectionRule::LastSuccessful, &BranchFilter::any())
            .unwrap()
            .unwrap();
        assert_eq!(any.run_counter, 4);

        let main = index
            .select(&lib, &SelectionRule::LastSuccessful, &BranchFilter::parse("+:main").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(main.run_counter, 3);

        let feature = BranchFilter::parse("+:feature/*\n-:feature/y").unwrap();
        let picked = index
            .select(&lib, &SelectionRule::LastSuccessful, &feature)
            .unwrap()
            .unwrap();
        assert_eq!(picked.run_counter, 2);
    }

    #[test]
    fn test_last_pinned_and_build_number() {
        let (mut index, ids) = index();
        let lib = BuildTypeId::from("Lib");
        assert!(
            index
                .select(&lib, &SelectionRule::LastPinned, &BranchFilter::any())
                .unwrap()
                .is_none()
        );

        index.set_pinned(ids[0], true);
        let pinned = index
            .select(&lib, &SelectionRule::LastPinned, &BranchFilter::any())
            .unwrap()
            .unwrap();
        assert_eq!(pinned.run_id, ids[0]);

        let by_number = SelectionRule::BuildNumber {
            number: "1.2".to_string(),
        };
        let found = index
            .select(&lib, &by_number, &BranchFilter::any())
            .unwrap()
            .unwrap();
        assert_eq!(found.run_id, ids[1]);
    }

    #[test]
    fn test_same_chain_must_be_resolved() {
        let (index, _) = index();
        assert!(
            index
                .select(&"Lib".into(), &SelectionRule::SameChain, &BranchFilter::any())
                .is_err()
        );
    }

    #[test]
    fn test_remove_drops_run() {
        let (mut index, ids) = index();
        assert!(index.remove(ids[3]).is_some());
        assert!(index.get(ids[3]).is_none());
        assert_eq!(index.len(), 4);
    }
}
