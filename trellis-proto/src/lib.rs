// Generated gRPC bindings for the worker ProcessService.
//
// Re-exported under a stable path so downstream crates use
// `trellis_proto::ProcessAck` etc. without caring about the proto package.

tonic::include_proto!("trellis.v1");
