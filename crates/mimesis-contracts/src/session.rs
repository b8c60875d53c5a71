use std::collections::BTreeSet;
use std::fmt;

use uuid::Uuid;

use crate::analysis::AnalysisOutcome;
use crate::files::{is_image_mime, validate_candidate, FileCandidate, UploadRejection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    FileSelected,
    Loading,
    Success,
    Error,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::FileSelected => "file-selected",
            SessionPhase::Loading => "loading",
            SessionPhase::Success => "success",
            SessionPhase::Error => "error",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    FileAccepted,
    FileRejected,
    AnalyzeRequested,
    AnalysisSucceeded,
    AnalysisFailed,
    FileRemoved,
}

/// Pure transition table. `None` marks a transition the session refuses;
/// callers keep the current phase in that case.
pub fn next_phase(phase: SessionPhase, event: SessionEvent) -> Option<SessionPhase> {
    use SessionEvent::*;
    use SessionPhase::*;
    match (phase, event) {
        // A rejected pick never leaves the current phase.
        (current, FileRejected) => Some(current),
        // Replacing the file from any settled phase re-enters file-selected.
        (Idle | FileSelected | Success | Error, FileAccepted) => Some(FileSelected),
        (FileSelected | Error, AnalyzeRequested) => Some(Loading),
        (Loading, AnalysisSucceeded) => Some(Success),
        (Loading, AnalysisFailed) => Some(Error),
        // Explicit reset; there is no automatic retry transition.
        (FileSelected | Success | Error, FileRemoved) => Some(Idle),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewHandle {
    id: Uuid,
}

impl PreviewHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Tracks preview resources the way the UI tracks object URLs: each handle
/// is created once and must be released exactly once.
#[derive(Debug, Default)]
pub struct PreviewRegistry {
    active: BTreeSet<Uuid>,
    released: u64,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> PreviewHandle {
        let id = Uuid::new_v4();
        self.active.insert(id);
        PreviewHandle { id }
    }

    pub fn release(&mut self, handle: &PreviewHandle) -> Result<(), String> {
        if !self.active.remove(&handle.id) {
            return Err(format!("preview {} already released", handle.id));
        }
        self.released += 1;
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn released_count(&self) -> u64 {
        self.released
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionRefusal {
    NoFileSelected,
    AnalysisInFlight,
    AlreadyComplete,
    NotLoading,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectError {
    Rejected(UploadRejection),
    Busy,
}

impl fmt::Display for SelectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectError::Rejected(rejection) => rejection.fmt(f),
            SelectError::Busy => write!(f, "an analysis is already in flight"),
        }
    }
}

impl fmt::Display for SessionRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRefusal::NoFileSelected => write!(f, "no file selected"),
            SessionRefusal::AnalysisInFlight => {
                write!(f, "an analysis is already in flight")
            }
            SessionRefusal::AlreadyComplete => {
                write!(f, "analysis already complete; remove the file to start over")
            }
            SessionRefusal::NotLoading => write!(f, "no analysis in flight"),
        }
    }
}

/// One browser session's worth of state: current phase, the selected file,
/// its preview handle, and the latest analysis text or error message.
/// Owns nothing shared; two sessions never interact.
#[derive(Debug, Default)]
pub struct SessionState {
    phase: Phase,
    file: Option<FileCandidate>,
    preview: Option<PreviewHandle>,
    previews: PreviewRegistry,
    analysis: Option<String>,
    error: Option<String>,
}

// SessionPhase has no natural default; Idle only makes sense here.
#[derive(Debug)]
struct Phase(SessionPhase);

impl Default for Phase {
    fn default() -> Self {
        Phase(SessionPhase::Idle)
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.0
    }

    pub fn file(&self) -> Option<&FileCandidate> {
        self.file.as_ref()
    }

    pub fn preview(&self) -> Option<&PreviewHandle> {
        self.preview.as_ref()
    }

    pub fn analysis(&self) -> Option<&str> {
        self.analysis.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn previews(&self) -> &PreviewRegistry {
        &self.previews
    }

    /// Validation gate. On rejection the phase is untouched and no preview
    /// is created; on acceptance any prior preview is released first. The
    /// picker is unavailable while an analysis is in flight.
    pub fn select_file(&mut self, candidate: FileCandidate) -> Result<(), SelectError> {
        if self.phase.0 == SessionPhase::Loading {
            return Err(SelectError::Busy);
        }
        if let Err(rejection) = validate_candidate(&candidate) {
            self.apply(SessionEvent::FileRejected);
            return Err(SelectError::Rejected(rejection));
        }

        self.release_preview();
        let wants_preview = candidate
            .mime_type
            .as_deref()
            .map(is_image_mime)
            .unwrap_or(false);
        if wants_preview {
            self.preview = Some(self.previews.create());
        }
        self.file = Some(candidate);
        self.analysis = None;
        self.error = None;
        self.apply(SessionEvent::FileAccepted);
        Ok(())
    }

    /// Single flight: refused outright while an analysis is loading. From
    /// `Success` the only way forward is the explicit reset.
    pub fn begin_analysis(&mut self) -> Result<(), SessionRefusal> {
        match self.phase.0 {
            SessionPhase::Loading => Err(SessionRefusal::AnalysisInFlight),
            SessionPhase::Success => Err(SessionRefusal::AlreadyComplete),
            SessionPhase::FileSelected | SessionPhase::Error => {
                self.analysis = None;
                self.apply(SessionEvent::AnalyzeRequested);
                Ok(())
            }
            SessionPhase::Idle => Err(SessionRefusal::NoFileSelected),
        }
    }

    pub fn complete_analysis(&mut self, outcome: &AnalysisOutcome) -> Result<(), SessionRefusal> {
        if self.phase.0 != SessionPhase::Loading {
            return Err(SessionRefusal::NotLoading);
        }
        match outcome {
            AnalysisOutcome::Success { analysis } => {
                self.analysis = Some(analysis.clone());
                self.error = None;
                self.apply(SessionEvent::AnalysisSucceeded);
            }
            AnalysisOutcome::Failure { error } => {
                self.analysis = None;
                self.error = Some(error.clone());
                self.apply(SessionEvent::AnalysisFailed);
            }
        }
        Ok(())
    }

    /// Explicit reset transition; also the only place previews are released.
    pub fn remove_file(&mut self) -> Result<(), SessionRefusal> {
        if self.phase.0 == SessionPhase::Loading {
            return Err(SessionRefusal::AnalysisInFlight);
        }
        if self.file.is_none() {
            return Err(SessionRefusal::NoFileSelected);
        }
        self.release_preview();
        self.file = None;
        self.analysis = None;
        self.error = None;
        self.apply(SessionEvent::FileRemoved);
        Ok(())
    }

    fn apply(&mut self, event: SessionEvent) {
        if let Some(next) = next_phase(self.phase.0, event) {
            self.phase = Phase(next);
        }
    }

    fn release_preview(&mut self) {
        if let Some(handle) = self.preview.take() {
            // The handle came from our own registry, so this cannot fail.
            let _ = self.previews.release(&handle);
        }
    }
}
