//! One-shot linking of a dynamically appearing decoder output.
//!
//! Demultiplexing decoders announce their outputs asynchronously, possibly more
//! than once and possibly for non-video streams. `NegotiationHandler` attaches the
//! first video output it sees to the fixed entry point of the processing core and
//! ignores everything after that.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::PipelineError;

/// A candidate connection point announced by the decoder.
pub trait MediaPad {
    /// Media type of the candidate's negotiated capabilities (e.g. `video/x-raw`).
    ///
    /// Any capability object queried to answer this is released before returning.
    fn media_type(&self) -> Option<String>;

    /// Name used in logs.
    fn describe(&self) -> String;
}

/// The fixed downstream entry point of the processing core.
pub trait EntryPoint {
    type Candidate: MediaPad;

    fn is_linked(&self) -> bool;

    fn link_from(&self, candidate: &Self::Candidate) -> Result<(), PipelineError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Unlinked,
    Linked,
}

/// True for media types that describe a video stream.
pub fn is_video(media_type: &str) -> bool {
    media_type.contains("video")
}

pub struct NegotiationHandler<E: EntryPoint> {
    entry: E,
    linked: AtomicBool,
}

impl<E: EntryPoint> NegotiationHandler<E> {
    pub fn new(entry: E) -> Self {
        Self {
            entry,
            linked: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LinkState {
        if self.linked.load(Ordering::Acquire) {
            LinkState::Linked
        } else {
            LinkState::Unlinked
        }
    }

    pub fn entry(&self) -> &E {
        &self.entry
    }

    /// Offer a new decoder output. Returns true only if this call made the link.
    ///
    /// Safe to call from several streaming threads at once: the first video
    /// candidate to claim the state links, every other call returns false.
    pub fn attach(&self, candidate: &E::Candidate) -> bool {
        if self.linked.load(Ordering::Acquire) || self.entry.is_linked() {
            log::debug!("ignoring {}: core entry already linked", candidate.describe());
            return false;
        }

        let Some(media_type) = candidate.media_type() else {
            log::debug!("ignoring {}: no negotiated caps", candidate.describe());
            return false;
        };
        if !is_video(&media_type) {
            log::debug!("ignoring {}: {} is not video", candidate.describe(), media_type);
            return false;
        }

        if self
            .linked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("ignoring {}: another output won the link", candidate.describe());
            return false;
        }

        match self.entry.link_from(candidate) {
            Ok(()) => {
                log::info!("linked {} ({}) to processing core", candidate.describe(), media_type);
                true
            }
            Err(e) => {
                // Release the claim so a later output can still link.
                self.linked.store(false, Ordering::Release);
                log::error!("failed to link {}: {}", candidate.describe(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    struct Pad(Option<&'static str>);

    impl MediaPad for Pad {
        fn media_type(&self) -> Option<String> {
            self.0.map(str::to_string)
        }

        fn describe(&self) -> String {
            format!("pad({:?})", self.0)
        }
    }

    /// Video pad whose caps query takes a while, widening the race window.
    struct SlowPad;

    impl MediaPad for SlowPad {
        fn media_type(&self) -> Option<String> {
            std::thread::sleep(std::time::Duration::from_millis(50));
            Some("video/x-raw".to_string())
        }

        fn describe(&self) -> String {
            "slow-pad".to_string()
        }
    }

    #[derive(Default)]
    struct Entry {
        linked: AtomicBool,
        links: AtomicUsize,
        refuse: bool,
    }

    impl EntryPoint for Entry {
        type Candidate = Pad;

        fn is_linked(&self) -> bool {
            self.linked.load(Ordering::SeqCst)
        }

        fn link_from(&self, _candidate: &Pad) -> Result<(), PipelineError> {
            if self.refuse {
                return Err(PipelineError::configuration("refused"));
            }
            self.links.fetch_add(1, Ordering::SeqCst);
            self.linked.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn links_exactly_once_for_repeated_video_outputs() {
        let handler = NegotiationHandler::new(Entry::default());
        let results: Vec<bool> = (0..3)
            .map(|_| handler.attach(&Pad(Some("video/x-raw"))))
            .collect();

        assert_eq!(results, vec![true, false, false]);
        assert_eq!(handler.state(), LinkState::Linked);
        assert_eq!(handler.entry().links.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_video_outputs_are_ignored() {
        let handler = NegotiationHandler::new(Entry::default());
        assert!(!handler.attach(&Pad(Some("audio/x-raw"))));
        assert!(!handler.attach(&Pad(None)));
        assert_eq!(handler.state(), LinkState::Unlinked);

        assert!(handler.attach(&Pad(Some("video/x-h264"))));
        assert_eq!(handler.state(), LinkState::Linked);
    }

    #[test]
    fn entry_linked_elsewhere_blocks_attach() {
        let entry = Entry::default();
        entry.linked.store(true, Ordering::SeqCst);
        let handler = NegotiationHandler::new(entry);

        assert!(!handler.attach(&Pad(Some("video/x-raw"))));
        assert_eq!(handler.entry().links.load(Ordering::SeqCst), 0);
        assert_eq!(handler.state(), LinkState::Unlinked);
    }

    #[test]
    fn failed_link_stays_unlinked() {
        let handler = NegotiationHandler::new(Entry {
            refuse: true,
            ..Entry::default()
        });
        assert!(!handler.attach(&Pad(Some("video/x-raw"))));
        assert_eq!(handler.state(), LinkState::Unlinked);
    }

    #[derive(Default)]
    struct SlowEntry {
        links: AtomicUsize,
    }

    impl EntryPoint for SlowEntry {
        type Candidate = SlowPad;

        fn is_linked(&self) -> bool {
            self.links.load(Ordering::SeqCst) > 0
        }

        fn link_from(&self, _candidate: &SlowPad) -> Result<(), PipelineError> {
            self.links.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn concurrent_outputs_link_exactly_once() {
        let handler = Arc::new(NegotiationHandler::new(SlowEntry::default()));
        let barrier = Arc::new(Barrier::new(3));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let handler = Arc::clone(&handler);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    handler.attach(&SlowPad)
                })
            })
            .collect();
        let wins = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(handler.entry().links.load(Ordering::SeqCst), 1);
        assert_eq!(handler.state(), LinkState::Linked);
    }

    #[test]
    fn failed_link_can_be_retried() {
        let handler = NegotiationHandler::new(Entry {
            refuse: true,
            ..Entry::default()
        });
        assert!(!handler.attach(&Pad(Some("video/x-raw"))));
        assert!(!handler.attach(&Pad(Some("video/x-raw"))));
        assert_eq!(handler.state(), LinkState::Unlinked);
        assert_eq!(handler.entry().links.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn video_detection_matches_substring() {
        assert!(is_video("video/x-raw"));
        assert!(is_video("video/x-raw(memory:NVMM)"));
        assert!(!is_video("audio/mpeg"));
    }
}
