//! Behavioural scenarios for the harness orchestrators.

mod harness;
