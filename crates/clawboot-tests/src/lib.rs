//! Integration test crate for clawboot. All scenarios live in `tests/`.
