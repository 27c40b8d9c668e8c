//! Pure loyalty domain: no I/O below this module.
pub mod aggregates;
pub mod events;
pub mod rules;
pub mod value_objects;
