//! Admin surface (spec §6). Grounded in the teacher's split between a request-serving listener and
//! a separate admin `axum::Router` bound to its own address.

pub mod admin;
