use std::io::{Read, Write};

use lunac_compiler::chunk::{self, DumpConfig};
use lunac_compiler::{disasm, generate, parse, tokenize};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut input: Option<String> = None;
    let mut output: Option<String> = None;
    let mut list = false;
    let mut parse_only = false;
    let mut strip = false;
    let mut wide_size_t = false;
    let mut saw_dashdash = false;

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        if saw_dashdash || arg == "-" || !arg.starts_with('-') {
            if input.is_some() {
                eprintln!("lunac: too many input files");
                std::process::exit(1);
            }
            input = Some(arg.to_string());
            i += 1;
            continue;
        }
        match arg {
            "--" => {
                saw_dashdash = true;
                i += 1;
            }
            "-l" => {
                list = true;
                i += 1;
            }
            "-p" => {
                parse_only = true;
                i += 1;
            }
            "-s" => {
                strip = true;
                i += 1;
            }
            "-S" => {
                // 8-byte size_t fields, for 64-bit reference loaders
                wide_size_t = true;
                i += 1;
            }
            "-o" => {
                if i + 1 >= args.len() {
                    eprintln!("lunac: '-o' needs argument");
                    std::process::exit(1);
                }
                output = Some(args[i + 1].clone());
                i += 2;
            }
            "-v" => {
                println!("lunac 0.1.0 -- Lua 5.1 cross-compiler");
                std::process::exit(0);
            }
            _ => {
                eprintln!("lunac: unrecognized option '{arg}'");
                eprintln!("usage: lunac [-l] [-p] [-s] [-S] [-o output] [--] file");
                std::process::exit(1);
            }
        }
    }

    let (source, chunk_name) = match input.as_deref() {
        None | Some("-") => {
            let mut buf = Vec::new();
            if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
                eprintln!("lunac: cannot read stdin: {e}");
                std::process::exit(1);
            }
            (buf, "=stdin".to_string())
        }
        Some(path) => {
            let source = match std::fs::read(path) {
                Ok(data) => data,
                Err(e) => {
                    eprintln!("lunac: cannot open {path}: {e}");
                    std::process::exit(1);
                }
            };
            (strip_shebang(source), format!("@{path}"))
        }
    };

    let tokens = tokenize(&source).unwrap_or_else(|e| {
        eprintln!("lunac: {}: {e}", input.as_deref().unwrap_or("stdin"));
        std::process::exit(1);
    });
    let ast = parse(tokens).unwrap_or_else(|e| {
        eprintln!("lunac: {}: {e}", input.as_deref().unwrap_or("stdin"));
        std::process::exit(1);
    });
    if parse_only {
        return;
    }
    let (proto, strings) = generate(ast, &chunk_name).unwrap_or_else(|e| {
        eprintln!("lunac: {}: {e}", input.as_deref().unwrap_or("stdin"));
        std::process::exit(1);
    });

    if list {
        print!("{}", disasm::disassemble(&proto, &strings));
        return;
    }

    let config = DumpConfig {
        size_t_width: if wide_size_t { 8 } else { 4 },
        strip,
    };
    let bytes = chunk::dump_with(&proto, &strings, &config);

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &bytes) {
                eprintln!("lunac: cannot write {path}: {e}");
                std::process::exit(1);
            }
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            if let Err(e) = handle.write_all(&bytes) {
                eprintln!("lunac: cannot write output: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn strip_shebang(source: Vec<u8>) -> Vec<u8> {
    if source.starts_with(b"#") {
        match source.iter().position(|&b| b == b'\n') {
            // Keep the newline so line numbers stay aligned
            Some(pos) => source[pos..].to_vec(),
            None => Vec::new(),
        }
    } else {
        source
    }
}
