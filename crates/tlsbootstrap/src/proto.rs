// Generated from proto/tlsbootstrap.proto
pub mod v1 {
	tonic::include_proto!("tlsbootstrap.v1");
}
