//! Terminal adapters shared by the engine, API, and tests.

pub mod simulated;
