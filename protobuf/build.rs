fn main() {
    println!("cargo:rerun-if-changed=./syncweb.proto");
    tonic_build::compile_protos("./syncweb.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
