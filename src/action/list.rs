use super::Executable;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

/// Custom ordering for a list, replacing the sort-key comparison
pub trait ListSorter<E>: Send + Sync {
    fn sort(&self, executables: &mut Vec<E>);
}

/// Ordered container for one kind of action
///
/// Tracks whether its contents are still sorted and caches the union of the
/// query spaces its actions touch until the list changes.
pub struct ExecutableList<E: Executable> {
    executables: Vec<E>,
    sorter: Option<Box<dyn ListSorter<E>>>,
    requires_sorting: bool,
    sorted: bool,
    query_spaces: OnceLock<BTreeSet<String>>,
}

impl<E: Executable> ExecutableList<E> {
    /// A list sorted by `ActionSortKey` when `requires_sorting` is set.
    pub fn new(requires_sorting: bool) -> Self {
        Self {
            executables: Vec::new(),
            sorter: None,
            requires_sorting,
            // an empty list is sorted
            sorted: requires_sorting,
            query_spaces: OnceLock::new(),
        }
    }

    pub fn with_sorter(sorter: Box<dyn ListSorter<E>>) -> Self {
        Self {
            executables: Vec::new(),
            sorter: Some(sorter),
            requires_sorting: true,
            sorted: true,
            query_spaces: OnceLock::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.executables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executables.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&E> {
        self.executables.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.executables.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.executables.iter_mut()
    }

    pub fn add(&mut self, executable: E) {
        if self.sorted {
            if self.sorter.is_some() {
                self.sorted = false;
            } else if let Some(previous_last) = self.executables.last() {
                if previous_last.sort_key().compare(&executable.sort_key()).is_gt() {
                    self.sorted = false;
                }
            }
        }

        if let Some(spaces) = self.query_spaces.get_mut() {
            spaces.extend(executable.property_spaces());
        }
        self.executables.push(executable);
    }

    pub fn remove(&mut self, index: usize) -> E {
        self.query_spaces.take();
        self.executables.remove(index)
    }

    /// Drops the last `n` actions (all of them when `n` exceeds the length).
    pub fn remove_last_n(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let keep = self.executables.len().saturating_sub(n);
        self.executables.truncate(keep);
        self.query_spaces.take();
    }

    pub fn clear(&mut self) {
        self.executables.clear();
        self.query_spaces.take();
        self.sorted = self.requires_sorting;
    }

    pub fn sort(&mut self) {
        if self.sorted || !self.requires_sorting {
            return;
        }

        match &self.sorter {
            Some(sorter) => sorter.sort(&mut self.executables),
            None => self
                .executables
                .sort_by(|a, b| a.sort_key().compare(&b.sort_key())),
        }
        self.sorted = true;
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn query_spaces(&self) -> &BTreeSet<String> {
        self.query_spaces.get_or_init(|| {
            self.executables
                .iter()
                .flat_map(|e| e.property_spaces())
                .collect()
        })
    }
}

impl<E: Executable> fmt::Debug for ExecutableList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableList")
            .field("executables", &self.executables)
            .field("requires_sorting", &self.requires_sorting)
            .field("sorted", &self.sorted)
            .finish()
    }
}
