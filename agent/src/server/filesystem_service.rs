// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Scoped filesystem endpoints. Path validation happens inside the
//! filesystem manager, before any I/O.

use tonic::{Request, Response, Status};

use mandau_api::to_proto_timestamp;
use mandau_api::v1::filesystem_service_server::FilesystemService;
use mandau_api::v1::{
    DeleteFileRequest, DeleteFileResponse, FileInfo, ListDirectoryRequest, ListDirectoryResponse,
    ReadFileRequest, ReadFileResponse, WriteFileRequest, WriteFileResponse,
};
use mandau_plugin::Resource;

use super::{fs_status, AgentState};

pub struct FilesystemApi {
    state: AgentState,
}

impl FilesystemApi {
    pub fn new(state: AgentState) -> Self {
        Self { state }
    }

    fn resource(path: &str) -> Resource {
        let mut resource = Resource::new("file", path);
        resource.labels = crate::filesystem::Manager::audit_labels(path);
        resource
    }
}

#[tonic::async_trait]
impl FilesystemService for FilesystemApi {
    async fn read_file(
        &self,
        request: Request<ReadFileRequest>,
    ) -> Result<Response<ReadFileResponse>, Status> {
        let path = request.get_ref().path.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.FilesystemService/ReadFile",
                "read",
                Self::resource(&path),
            )
            .await?;

        let fs = self.state.fs.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                let content = fs.read_file(&path).map_err(fs_status)?;
                Ok(Response::new(ReadFileResponse { content }))
            })
            .await
    }

    async fn write_file(
        &self,
        request: Request<WriteFileRequest>,
    ) -> Result<Response<WriteFileResponse>, Status> {
        let path = request.get_ref().path.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.FilesystemService/WriteFile",
                "write",
                Self::resource(&path),
            )
            .await?;

        let fs = self.state.fs.clone();
        let content = request.into_inner().content;
        self.state
            .pipeline
            .unary(guard, async move {
                let bytes_written = fs.write_file(&path, &content).map_err(fs_status)?;
                Ok(Response::new(WriteFileResponse { bytes_written }))
            })
            .await
    }

    async fn list_directory(
        &self,
        request: Request<ListDirectoryRequest>,
    ) -> Result<Response<ListDirectoryResponse>, Status> {
        let path = request.get_ref().path.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.FilesystemService/ListDirectory",
                "read",
                Self::resource(&path),
            )
            .await?;

        let fs = self.state.fs.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                let entries = fs.list_directory(&path).map_err(fs_status)?;
                Ok(Response::new(ListDirectoryResponse {
                    entries: entries
                        .into_iter()
                        .map(|e| FileInfo {
                            name: e.name,
                            path: e.path,
                            size: e.size,
                            is_dir: e.is_dir,
                            modified_at: Some(to_proto_timestamp(e.modified_at)),
                        })
                        .collect(),
                }))
            })
            .await
    }

    async fn delete_file(
        &self,
        request: Request<DeleteFileRequest>,
    ) -> Result<Response<DeleteFileResponse>, Status> {
        let path = request.get_ref().path.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.FilesystemService/DeleteFile",
                "write",
                Self::resource(&path),
            )
            .await?;

        let fs = self.state.fs.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                fs.delete(&path).map_err(fs_status)?;
                Ok(Response::new(DeleteFileResponse { deleted: true }))
            })
            .await
    }
}
