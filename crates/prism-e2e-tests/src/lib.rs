//! End-to-end tests for Prism. The tests live under `tests/`.
