//! Injected build-number sequence.

use std::sync::Mutex;

use crate::domain::record::BuildId;

/// Process-wide monotonic build-number source.
///
/// Callers own the sequence and pass the issued [`BuildId`] to the
/// controller; nothing reads ambient global state. Initialise it from the
/// last build number the artifact store knows about.
#[derive(Debug)]
pub struct BuildSequence {
    last: Mutex<u64>,
}

impl BuildSequence {
    /// A sequence whose first issued id is `last + 1`.
    pub fn starting_after(last: Option<BuildId>) -> Self {
        Self {
            last: Mutex::new(last.map(|b| b.0).unwrap_or(0)),
        }
    }

    /// Issue the next build number.
    pub fn next(&self) -> BuildId {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        *last += 1;
        BuildId(*last)
    }

    /// Last issued build number, if any.
    pub fn current(&self) -> Option<BuildId> {
        let last = *self.last.lock().unwrap_or_else(|p| p.into_inner());
        (last > 0).then_some(BuildId(last))
    }
}

impl Default for BuildSequence {
    fn default() -> Self {
        Self::starting_after(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sequence_starts_at_one() {
        let seq = BuildSequence::default();
        assert_eq!(seq.current(), None);
        assert_eq!(seq.next(), BuildId(1));
        assert_eq!(seq.next(), BuildId(2));
        assert_eq!(seq.current(), Some(BuildId(2)));
    }

    #[test]
    fn test_sequence_resumes_after_last() {
        let seq = BuildSequence::starting_after(Some(BuildId(6)));
        assert_eq!(seq.next(), BuildId(7));
    }

    #[test]
    fn test_sequence_unique_across_threads() {
        let seq = Arc::new(BuildSequence::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || (0..50).map(|_| seq.next().0).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(all.last(), Some(&400));
    }
}
