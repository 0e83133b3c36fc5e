pub mod fixtures;

// vim: ts=4
