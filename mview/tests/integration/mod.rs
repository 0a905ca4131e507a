mod common;
mod pipeline_test;
mod provider_test;
