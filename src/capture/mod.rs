//! Capture sources: the per-tab page agent and the background download
//! observer, plus how they acquire report bytes.

pub mod agent;
pub mod fetch;
pub mod observer;

pub use agent::{
    AgentRegistry, CaptureAgent, DownloadTrigger, PageEvent, PageObservation, PageOutcome, observe,
};
pub use fetch::{ContentFetcher, FetchError, HttpFetcher};
pub use observer::{DownloadDirWatcher, DownloadEvent, DownloadObserver, DownloadState, ObserveOutcome};
