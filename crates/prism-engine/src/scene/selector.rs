/// One selectable scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneEntry {
    pub id: String,
    pub title: String,
}

/// Selection model behind the scene picker.
///
/// Holds an ordered list of scenes and the current choice; navigation wraps.
#[derive(Debug, Clone)]
pub struct SceneSelector {
    entries: Vec<SceneEntry>,
    current: usize,
}

impl SceneSelector {
    pub fn new(entries: Vec<SceneEntry>) -> Self {
        Self {
            entries,
            current: 0,
        }
    }

    pub fn entries(&self) -> &[SceneEntry] {
        &self.entries
    }

    pub fn current(&self) -> Option<&SceneEntry> {
        self.entries.get(self.current)
    }

    /// Selects `id`. Unknown ids leave the selection unchanged.
    pub fn select(&mut self, id: &str) -> Option<&SceneEntry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        self.current = index;
        self.current()
    }

    pub fn select_index(&mut self, index: usize) -> Option<&SceneEntry> {
        if index >= self.entries.len() {
            return None;
        }
        self.current = index;
        self.current()
    }

    pub fn next(&mut self) -> Option<&SceneEntry> {
        if self.entries.is_empty() {
            return None;
        }
        self.current = (self.current + 1) % self.entries.len();
        self.current()
    }

    pub fn previous(&mut self) -> Option<&SceneEntry> {
        if self.entries.is_empty() {
            return None;
        }
        self.current = (self.current + self.entries.len() - 1) % self.entries.len();
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> SceneSelector {
        SceneSelector::new(
            ["a", "b", "c"]
                .into_iter()
                .map(|id| SceneEntry {
                    id: id.to_string(),
                    title: id.to_uppercase(),
                })
                .collect(),
        )
    }

    #[test]
    fn navigation_wraps() {
        let mut s = selector();
        assert_eq!(s.previous().unwrap().id, "c");
        assert_eq!(s.next().unwrap().id, "a");
        assert_eq!(s.next().unwrap().id, "b");
    }

    #[test]
    fn unknown_selection_keeps_current() {
        let mut s = selector();
        s.select("b");
        assert!(s.select("zzz").is_none());
        assert!(s.select_index(9).is_none());
        assert_eq!(s.current().unwrap().id, "b");
    }

    #[test]
    fn empty_selector_has_no_current() {
        let mut s = SceneSelector::new(Vec::new());
        assert!(s.current().is_none());
        assert!(s.next().is_none());
        assert!(s.previous().is_none());
    }
}
