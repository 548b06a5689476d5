//! Component tests, grouped under `tests/unit/`.

mod unit;
