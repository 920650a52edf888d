//! End-to-end tests for the self-update pipeline.
//!
//! Every test builds a throwaway live installation in a temp dir, serves
//! releases from an in-memory [`FakeReleaseSource`] and records restarts
//! instead of performing them.

mod harness;
mod update_tests;

pub use harness::{
    payload_files, tar_gz_bytes, within, zip_bytes, FailAfter, FakeReleaseSource,
    RecordingSupervisor, StallAfter, TestHarness, TestInstall, TRACKED,
};
