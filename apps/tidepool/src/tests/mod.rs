mod support;

mod bootstrap;
mod teardown;
mod workspace;
