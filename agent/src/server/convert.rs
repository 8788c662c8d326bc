// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Conversions between agent domain types and the wire protocol.

use mandau_api::v1;
use mandau_api::{to_proto_timestamp};

use crate::docker::ContainerInfo;
use crate::operation::{Event, Operation, OperationState};
use crate::stack::{DiffAction, DiffResult, Stack, StackState};

pub fn stack_state(state: StackState) -> v1::StackState {
    match state {
        StackState::Unknown => v1::StackState::Unknown,
        StackState::Running => v1::StackState::Running,
        StackState::Stopped => v1::StackState::Stopped,
        StackState::Error => v1::StackState::Error,
        StackState::Partial => v1::StackState::Partial,
    }
}

pub fn operation_state(state: OperationState) -> v1::OperationState {
    match state {
        OperationState::Pending => v1::OperationState::Pending,
        OperationState::Running => v1::OperationState::Running,
        OperationState::Completed => v1::OperationState::Completed,
        OperationState::Failed => v1::OperationState::Failed,
        OperationState::Cancelled => v1::OperationState::Cancelled,
    }
}

pub fn operation_state_from_proto(state: v1::OperationState) -> OperationState {
    match state {
        v1::OperationState::Pending => OperationState::Pending,
        v1::OperationState::Running => OperationState::Running,
        v1::OperationState::Completed => OperationState::Completed,
        v1::OperationState::Failed => OperationState::Failed,
        v1::OperationState::Cancelled => OperationState::Cancelled,
    }
}

pub fn diff_action(action: DiffAction) -> v1::DiffAction {
    match action {
        DiffAction::None => v1::DiffAction::None,
        DiffAction::Create => v1::DiffAction::Create,
        DiffAction::Update => v1::DiffAction::Update,
        DiffAction::Delete => v1::DiffAction::Delete,
    }
}

pub fn container(info: &ContainerInfo) -> v1::Container {
    v1::Container {
        id: info.id.clone(),
        name: info.name.clone(),
        image: info.image.clone(),
        state: info.state.clone(),
        status: info.status.clone(),
        service: info.service.clone(),
        labels: info.labels.clone(),
    }
}

pub fn stack(stack: &Stack) -> v1::Stack {
    v1::Stack {
        id: stack.id.clone(),
        name: stack.name.clone(),
        path: stack.path.to_string_lossy().into_owned(),
        state: stack_state(stack.state) as i32,
        containers: stack.containers.iter().map(container).collect(),
        created_at: Some(to_proto_timestamp(stack.created_at)),
        updated_at: Some(to_proto_timestamp(stack.updated_at)),
        labels: stack.labels.clone(),
    }
}

pub fn operation_event(event: &Event) -> v1::OperationEvent {
    v1::OperationEvent {
        operation_id: event.operation_id.clone(),
        state: operation_state(event.state) as i32,
        timestamp: Some(to_proto_timestamp(event.timestamp)),
        message: event.message.clone(),
        progress: event.progress,
        error: event.error.clone().unwrap_or_default(),
    }
}

pub fn operation(op: &Operation) -> v1::Operation {
    v1::Operation {
        id: op.id.clone(),
        r#type: op.op_type.as_str().to_string(),
        state: operation_state(op.state) as i32,
        progress: op.progress,
        metadata: op.metadata.clone(),
        created_at: Some(to_proto_timestamp(op.created_at)),
        completed_at: op.completed_at.map(to_proto_timestamp),
        error: op.error.clone().unwrap_or_default(),
    }
}

pub fn diff_result(result: &DiffResult) -> v1::DiffStackResponse {
    v1::DiffStackResponse {
        services: result
            .services
            .iter()
            .map(|d| v1::ServiceDiff {
                name: d.name.clone(),
                action: diff_action(d.action) as i32,
                changes: d.changes.clone(),
            })
            .collect(),
        has_changes: result.has_changes,
    }
}
