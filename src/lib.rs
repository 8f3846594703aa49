#![allow(
    clippy::module_name_repetitions,
    clippy::cast_sign_loss,
    rustdoc::broken_intra_doc_links
)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![deny(unused_must_use)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! A Public.com brokerage trading API system covering the REST surface and
//! the polling-based subscription engine that stands in for a streaming
//! channel.
//!
//! To start trading and reading account data, refer to
//! [`crate::client::PublicApiClient::new`].
//!
//! To receive price change callbacks, refer to
//! [`crate::subscription::price::PriceSubscriptionManager`]; to track or
//! wait on placed orders, refer to [`crate::order_handle::NewOrder`].

pub mod auth;
pub mod client;
pub mod error;
pub mod order_handle;
pub mod prelude;
pub mod rest;
pub mod subscription;
pub mod utils;
