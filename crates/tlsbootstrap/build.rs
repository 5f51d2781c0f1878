// Generates the gRPC types for the bootstrap token protocol.
fn main() -> Result<(), anyhow::Error> {
	let proto_files = ["proto/tlsbootstrap.proto"]
		.iter()
		.map(|name| std::env::current_dir().unwrap().join(name))
		.collect::<Vec<_>>();
	let include_dirs = ["proto/"]
		.iter()
		.map(|i| std::env::current_dir().unwrap().join(i))
		.collect::<Vec<_>>();
	let fds = protox::compile(&proto_files, &include_dirs)?;
	let config = {
		let mut c = prost_build::Config::new();
		c.disable_comments(Some("."));
		c
	};
	tonic_prost_build::configure()
		.build_server(true)
		.build_client(true)
		.compile_fds_with_config(fds, config)?;

	for path in [proto_files, include_dirs].concat() {
		println!("cargo:rerun-if-changed={}", path.to_str().unwrap());
	}
	Ok(())
}
