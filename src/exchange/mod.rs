pub mod models;
pub mod push;
pub mod rest;
pub mod signer;
