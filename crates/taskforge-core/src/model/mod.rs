// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by the execution plane and the persistence layer.

mod integration;
mod project;
mod schedule;
mod task;
mod template;

pub use integration::{
    generate_alias, BodyDataType, Integration, IntegrationAlias, IntegrationExtractValue,
    IntegrationMatcher, MatchMethod, MatcherType, ValueSource, VariableType,
};
pub use project::{
    AccessKey, AccessKeyKind, Environment, EnvironmentSecret, EnvironmentSecretKind, Event,
    Inventory, NodeHeartbeat, Project, Repository,
};
pub use schedule::{Schedule, ScheduleKind};
pub use task::{Task, TaskOutputRow, TaskParams, TaskStatus};
pub use template::{
    AppKind, ArgSet, Template, TemplateVault, TerraformTaskParams, TerraformTemplateParams,
};
