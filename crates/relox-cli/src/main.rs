use clap::Parser;
use relox::pe::parser::{PeFile, SectionHeader};
use relox::PeRecompiler;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "relox", version, about = "Relocation-based PE32 obfuscator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Obfuscate a PE32 file via on-disk rebasing and reloc re-encoding
    Obfuscate {
        /// Input PE file path
        input: PathBuf,
        /// Output PE file path
        #[arg(short, long)]
        output: PathBuf,
        /// Use the Windows 10 ASLR-preselection attack (keeps ASLR and the
        /// original relocation table, injects a stub section)
        #[arg(long)]
        win10: bool,
        /// Layer each rewrite twice through its multi-pass chain
        #[arg(long)]
        multi_pass: bool,
        /// Also rewrite a whole section by name (repeatable)
        #[arg(long = "section", value_name = "NAME")]
        sections: Vec<String>,
        /// Also rewrite every occurrence of a string (repeatable)
        #[arg(long = "string", value_name = "NEEDLE")]
        strings: Vec<String>,
        /// Skip the entry-point header rewrite
        #[arg(long)]
        skip_entry: bool,
        /// Skip the ImageBase fixup rewrite
        #[arg(long)]
        skip_base: bool,
        /// Skip import-table obfuscation
        #[arg(long)]
        skip_imports: bool,
    },
    /// Print the structure of a PE32 file
    Analyze {
        /// Input PE file path
        input: PathBuf,
    },
    /// Scan a PE32 file's sections for readable strings
    Strings {
        /// Input PE file path
        input: PathBuf,
        /// Minimum string length
        #[arg(short = 'n', long, default_value = "6")]
        min_len: usize,
    },
}

fn main() {
    let cli = Cli::parse();
    let ok = match cli.command {
        Command::Obfuscate {
            input,
            output,
            win10,
            multi_pass,
            sections,
            strings,
            skip_entry,
            skip_base,
            skip_imports,
        } => run_obfuscate(
            &input,
            &output,
            win10,
            multi_pass,
            &sections,
            &strings,
            skip_entry,
            skip_base,
            skip_imports,
        ),
        Command::Analyze { input } => run_analyze(&input),
        Command::Strings { input, min_len } => run_strings(&input, min_len),
    };

    if !ok {
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn run_obfuscate(
    input: &Path,
    output: &Path,
    win10: bool,
    multi_pass: bool,
    sections: &[String],
    strings: &[String],
    skip_entry: bool,
    skip_base: bool,
    skip_imports: bool,
) -> bool {
    println!("[*] input:  {}", input.display());
    println!("[*] output: {}", output.display());
    if win10 {
        println!("[*] mode: windows 10 ASLR-preselection attack");
    }
    if multi_pass {
        println!("[*] multi-pass rewrites: enabled");
    }

    let mut rec = PeRecompiler::new(io::stdout(), io::stderr(), input, output);
    rec.use_windows10_attack(win10);
    rec.do_multi_pass(multi_pass);

    if !rec.load_input_file() || !rec.load_input_sections() {
        return false;
    }
    if !rec.perform_on_disk_relocations() {
        return false;
    }

    if !skip_entry && !rec.rewrite_header() {
        return false;
    }
    // In win10 mode the original relocation table survives, so queueing a
    // base fixup would (correctly) abort emission; leave the field alone.
    if !win10 && !skip_base && !rec.fixup_base() {
        return false;
    }
    if !skip_imports && !rec.rewrite_imports() {
        return false;
    }

    if win10 && (!sections.is_empty() || !strings.is_empty()) {
        println!("[*] win10 attack: skipping section/string rewrites");
    } else {
        for name in sections {
            if !rec.rewrite_section(name) {
                return false;
            }
        }
        for needle in strings {
            if !rec.rewrite_matches(needle) {
                return false;
            }
        }
    }

    if !rec.write_output_file() {
        return false;
    }

    println!("[+] obfuscated binary written to {}", output.display());
    true
}

fn run_analyze(input: &Path) -> bool {
    let pe = match load_pe(input) {
        Some(pe) => pe,
        None => return false,
    };

    println!("[*] PE32 image: {}", input.display());
    println!(
        "    machine: 0x{:04X}   sections: {}",
        pe.coff_header.machine, pe.coff_header.number_of_sections
    );
    println!(
        "    entry point: 0x{:08X}   image base: 0x{:08X}",
        pe.optional_header.entry_point, pe.optional_header.image_base
    );
    println!(
        "    dll characteristics: 0x{:04X} (ASLR {})",
        pe.optional_header.dll_characteristics,
        if pe.has_dynamic_base() { "on" } else { "off" }
    );
    println!(
        "    size of image: 0x{:08X}   size of headers: 0x{:08X}",
        pe.optional_header.size_of_image, pe.optional_header.size_of_headers
    );

    let named = [(1usize, "import"), (5, "basereloc"), (12, "iat")];
    for (index, label) in named {
        let dir = pe.directory(index);
        if dir.virtual_address != 0 {
            println!(
                "    directory {label:<10} RVA 0x{:08X}  size 0x{:X}",
                dir.virtual_address, dir.size
            );
        }
    }

    println!("    {:<10}{:<12}{:<12}{:<12}{:<12}", "name", "vsize", "rsize", "va", "raw");
    for section in &pe.sections {
        println!(
            "    {:<10}0x{:08X}  0x{:08X}  0x{:08X}  0x{:08X}",
            section.name_str(),
            section.virtual_size,
            section.size_of_raw_data,
            section.virtual_address,
            section.pointer_to_raw_data
        );
    }
    true
}

fn run_strings(input: &Path, min_len: usize) -> bool {
    let pe = match load_pe(input) {
        Some(pe) => pe,
        None => return false,
    };

    let min_len = min_len.max(1);
    for section in &pe.sections {
        let data = section_raw(&pe, section);
        let mut start = None;
        for (i, &b) in data.iter().chain(std::iter::once(&0u8)).enumerate() {
            let printable = (0x20..0x7F).contains(&b);
            match (printable, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    if i - s >= min_len {
                        let text = String::from_utf8_lossy(&data[s..i]);
                        println!("{:<10}0x{s:08X}  {text}", section.name_str());
                    }
                    start = None;
                }
                _ => {}
            }
        }
    }
    true
}

fn load_pe(input: &Path) -> Option<PeFile> {
    let bytes = match fs::read(input) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("error reading '{}': {e}", input.display());
            return None;
        }
    };
    match PeFile::parse(bytes) {
        Ok(pe) => Some(pe),
        Err(e) => {
            eprintln!("error parsing PE: {e}");
            None
        }
    }
}

/// Raw bytes of one section, clamped to what the file actually holds.
fn section_raw<'a>(pe: &'a PeFile, section: &SectionHeader) -> &'a [u8] {
    let start = section.pointer_to_raw_data as usize;
    let end = start + section.size_of_raw_data as usize;
    let end = end.min(pe.data.len());
    let start = start.min(end);
    &pe.data[start..end]
}
