///////////////////////////////////////////////////////////////////////////////
// Runtime ////////////////////////////////////////////////////////////////////

/// A request to load a feature program.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadProgramRequest {
    /// The ID of this request.
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    /// The FQN of the feature the program belongs to.
    #[prost(string, tag = "2")]
    pub fqn: ::prost::alloc::string::String,
    /// The source code of the program.
    #[prost(string, tag = "3")]
    pub program: ::prost::alloc::string::String,
    /// Dependency packages of the program.
    #[prost(string, repeated, tag = "4")]
    pub packages: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// The runtime environment of the program.
    #[prost(string, tag = "5")]
    pub runtime: ::prost::alloc::string::String,
}
/// A response to a program load request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadProgramResponse {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    /// The ID of the loaded program.
    #[prost(string, tag = "2")]
    pub program_id: ::prost::alloc::string::String,
}
/// A request to execute a feature program.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteProgramRequest {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    /// The ID of the program to execute.
    #[prost(string, tag = "2")]
    pub program_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub fqn: ::prost::alloc::string::String,
    /// The key fields of the entity.
    #[prost(map = "string, string", tag = "4")]
    pub keys: ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
    /// The JSON encoded row.
    #[prost(bytes = "vec", tag = "5")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    /// The event time, in unix nanoseconds.
    #[prost(int64, tag = "6")]
    pub timestamp: i64,
}
/// The outcome of a program execution.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteProgramResponse {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    /// The JSON encoded value, empty if the program produced no value.
    #[prost(bytes = "vec", tag = "2")]
    pub result: ::prost::alloc::vec::Vec<u8>,
    /// The timestamp of the value, in unix nanoseconds.
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    /// The ID of the entity the value belongs to.
    #[prost(string, tag = "4")]
    pub entity_id: ::prost::alloc::string::String,
}
///////////////////////////////////////////////////////////////////////////////
// Engine /////////////////////////////////////////////////////////////////////

/// A request to update a feature value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRequest {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub fqn: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub entity_id: ::prost::alloc::string::String,
    /// The JSON encoded value.
    #[prost(bytes = "vec", tag = "4")]
    pub value: ::prost::alloc::vec::Vec<u8>,
    /// The timestamp of the value, in unix nanoseconds.
    #[prost(int64, tag = "5")]
    pub timestamp: i64,
}
/// A response to a feature update.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateResponse {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
}
#[doc = r" Generated client implementations."]
pub mod runtime_service_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::*;
    #[doc = " The feature program runtime interface."]
    #[derive(Debug, Clone)]
    pub struct RuntimeServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl RuntimeServiceClient<tonic::transport::Channel> {
        #[doc = r" Attempt to create a new client by connecting to a given endpoint."]
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> RuntimeServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + Send + Sync + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        #[doc = " Load a feature program, returning its program ID."]
        pub async fn load_program(&mut self, request: impl tonic::IntoRequest<super::LoadProgramRequest>) -> Result<tonic::Response<super::LoadProgramResponse>, tonic::Status> {
            self.inner
                .ready()
                .await
                .map_err(|e| tonic::Status::new(tonic::Code::Unknown, format!("Service was not ready: {}", e.into())))?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raptor.runtime.v1alpha1.RuntimeService/LoadProgram");
            self.inner.unary(request.into_request(), path, codec).await
        }
        #[doc = " Execute a previously loaded feature program."]
        pub async fn execute_program(
            &mut self, request: impl tonic::IntoRequest<super::ExecuteProgramRequest>,
        ) -> Result<tonic::Response<super::ExecuteProgramResponse>, tonic::Status> {
            self.inner
                .ready()
                .await
                .map_err(|e| tonic::Status::new(tonic::Code::Unknown, format!("Service was not ready: {}", e.into())))?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raptor.runtime.v1alpha1.RuntimeService/ExecuteProgram");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}
#[doc = r" Generated client implementations."]
pub mod engine_service_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::*;
    #[doc = " The feature engine interface."]
    #[derive(Debug, Clone)]
    pub struct EngineServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl EngineServiceClient<tonic::transport::Channel> {
        #[doc = r" Attempt to create a new client by connecting to a given endpoint."]
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> EngineServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + Send + Sync + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        #[doc = " Update the value of a feature for an entity."]
        pub async fn update(&mut self, request: impl tonic::IntoRequest<super::UpdateRequest>) -> Result<tonic::Response<super::UpdateResponse>, tonic::Status> {
            self.inner
                .ready()
                .await
                .map_err(|e| tonic::Status::new(tonic::Code::Unknown, format!("Service was not ready: {}", e.into())))?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raptor.core.v1alpha1.EngineService/Update");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}
