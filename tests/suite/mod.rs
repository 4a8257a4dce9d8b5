mod session;
mod teardown;
