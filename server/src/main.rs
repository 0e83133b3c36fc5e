use relaymesh::run_from_env;

#[tokio::main]
async fn main() {
	let code = run_from_env().await;
	std::process::exit(code);
}

// vim: ts=4
