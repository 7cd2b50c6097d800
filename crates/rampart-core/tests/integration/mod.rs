mod batch_tests;
mod common;
mod composition_tests;
mod registry_tests;
