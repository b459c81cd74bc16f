//! Build script for the execution store.
//!
//! `sqlx::migrate!` embeds the migrations at compile time, so cargo has to
//! rebuild this crate whenever one of them changes.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
