//! # EvilLens
//!
//! Governance backend for harmful short-video monitoring.
//!
//! EvilLens ingests CSV/JSON exports of suspicious videos, normalizes them,
//! derives account and posting statistics, runs multi-round detection tasks
//! against external detector/explorer programs, keeps track of videos that
//! have been taken down, and serves it all to a dashboard over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────┐   ┌──────────┐   ┌───────────┐   ┌────────┐
//! │ inbox dir │──▶│ loader │──▶│ analysis │──▶│ persister │──▶│ SQLite │
//! │ (watcher) │   └────────┘   └──────────┘   └───────────┘   └───┬────┘
//! └───────────┘        ▲                                          │
//!                      │ round files                              │
//!              ┌───────┴──────┐   ┌──────────┐                    │
//!              │ task workers │   │ liveness │────────────────────┤
//!              └──────────────┘   └──────────┘                    ▼
//!                      ▲                                    ┌──────────┐
//!                      └────────────────────────────────────│ HTTP API │
//!                                                           └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! evillens init                     # create database and admin account
//! evillens ingest exports/top.csv   # ingest one export
//! evillens serve                    # start API, workers, scheduler, watcher
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`loader`] | CSV/JSON normalization and cover downloads |
//! | [`analysis`] | Rollups, histograms, correlations |
//! | [`similarity`] | Author similarity (posting hours + name n-grams) |
//! | [`persist`] | Transactional batch upserts |
//! | [`ingest`] | File → pipeline → archive |
//! | [`watcher`] | Inbox directory watcher |
//! | [`links`] | Link extraction and short-link resolution |
//! | [`detect`] | External detector/explorer programs |
//! | [`tasks`] | Task store |
//! | [`orchestrator`] | Task queue and workers |
//! | [`rounds`] | Expansion round files |
//! | [`liveness`] | Media takedown checks |
//! | [`report`] | Evidence reports and governance summary |
//! | [`dashboard`] | Read-only dashboard queries |
//! | [`auth`] | Accounts and session tokens |
//! | [`mail`] | Mailing the output directory |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analysis;
pub mod auth;
pub mod config;
pub mod context;
pub mod dashboard;
pub mod db;
pub mod detect;
pub mod error;
pub mod ingest;
pub mod links;
pub mod liveness;
pub mod loader;
pub mod mail;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod persist;
pub mod report;
pub mod rounds;
pub mod server;
pub mod similarity;
pub mod stats;
pub mod tasks;
pub mod watcher;
