use assert_cmd::Command;
use predicates::prelude::*;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

/// A scratch project directory with its own cache directory and a fake
/// compiler that understands -E (emit linemarkers and include expansion)
/// and -c (write a derived object file).
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Result<Self, Box<dyn Error>> {
        let dir = tempdir()?;
        let compiler = dir.path().join("gcc");
        fs::write(
            &compiler,
            r#"#!/bin/sh
mode=compile
out=""
input=""
for arg in "$@"; do
    case "$arg" in
        -E) mode=preprocess ;;
        -o) expect_out=1; continue ;;
        -c) ;;
        -*) ;;
        *)
            if [ "${expect_out:-}" = 1 ]; then
                out="$arg"; expect_out=
            else
                input="$arg"
            fi
            ;;
    esac
done
if grep -q '#error' "$input"; then
    echo "$input: error directive" >&2
    exit 1
fi
if [ "$mode" = preprocess ]; then
    printf '# 1 "%s"\n' "$input"
    cat "$input"
    if grep -q '#include "foo.h"' "$input"; then
        printf '# 1 "foo.h" 1\n'
        cat foo.h
    fi
else
    { echo "OBJ"; cat "$input"; } > "$out"
fi
exit 0
"#,
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&compiler, fs::Permissions::from_mode(0o755))?;
        }
        fs::create_dir(dir.path().join("cache"))?;
        Ok(Fixture { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    fn write(&self, name: &str, content: &str) -> Result<(), Box<dyn Error>> {
        fs::write(self.dir.path().join(name), content)?;
        // Keep header timestamps safely in the past so freshly written
        // files are not refused as too new.
        std::process::Command::new("touch")
            .args(["-d", "2000-01-01 00:00:00", name])
            .current_dir(self.dir.path())
            .status()?;
        Ok(())
    }

    fn ccache(&self) -> Result<Command, Box<dyn Error>> {
        let mut cmd = Command::cargo_bin("ccache")?;
        cmd.current_dir(self.dir.path());
        cmd.env("CCACHE_DIR", self.cache_dir());
        cmd.env_remove("CCACHE_DISABLE");
        // ctime cannot be backdated, so a header written moments before a
        // compilation would always be refused as too new.
        cmd.env("CCACHE_SLOPPINESS", "include_file_ctime");
        Ok(cmd)
    }

    fn compile(&self, args: &[&str]) -> Result<Command, Box<dyn Error>> {
        let mut cmd = self.ccache()?;
        cmd.arg("./gcc");
        cmd.args(args);
        Ok(cmd)
    }

    fn stat(&self, id: &str) -> Result<u64, Box<dyn Error>> {
        let output = self.ccache()?.arg("--print-stats").output()?;
        let text = String::from_utf8(output.stdout)?;
        for line in text.lines() {
            if let Some((name, value)) = line.split_once('\t') {
                if name == id {
                    return Ok(value.parse()?);
                }
            }
        }
        Ok(0)
    }
}

#[test]
fn test_version() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("ccache")?;
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("ccache"));
    Ok(())
}

#[test]
fn test_help() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("ccache")?;
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("compiler [compiler options]"));
    Ok(())
}

#[test]
fn test_no_arguments_prints_usage() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("ccache")?;
    cmd.assert().failure();
    Ok(())
}

#[test]
fn test_unknown_option_fails() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("ccache")?;
    cmd.arg("--frobnicate");
    cmd.assert().failure();
    Ok(())
}

#[test]
fn test_show_config() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture
        .ccache()?
        .arg("--show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("direct_mode = true"))
        .stdout(predicate::str::contains("cache_dir"));
    Ok(())
}

#[test]
fn test_set_and_get_config() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture
        .ccache()?
        .args(["-o", "max_files=420"])
        .assert()
        .success();
    fixture
        .ccache()?
        .args(["-k", "max_files"])
        .assert()
        .success()
        .stdout(predicate::str::contains("420"));
    // Unknown keys are an error.
    fixture
        .ccache()?
        .args(["-k", "no_such_key"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn test_max_size_option() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture
        .ccache()?
        .args(["-M", "10G"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set cache size limit to 10.0 GB"));
    let config = fs::read_to_string(fixture.cache_dir().join("ccache.conf"))?;
    assert!(config.contains("max_size = 10G"));
    Ok(())
}

#[test]
fn test_hash_file_of_stdin() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    let mut cmd = fixture.ccache()?;
    cmd.arg("--hash-file").arg("-");
    cmd.write_stdin("hello");
    let first = cmd.output()?;
    assert!(first.status.success());
    let hex = String::from_utf8(first.stdout.clone())?;
    assert_eq!(hex.trim().len(), 40);
    assert!(hex.trim().chars().all(|c| c.is_ascii_hexdigit()));

    let mut cmd = fixture.ccache()?;
    cmd.arg("--hash-file").arg("-");
    cmd.write_stdin("hello");
    let second = cmd.output()?;
    assert_eq!(first.stdout, second.stdout);
    Ok(())
}

#[test]
fn test_zero_stats() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture
        .ccache()?
        .arg("--zero-stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("Statistics zeroed"));
    Ok(())
}

#[test]
fn test_miss_then_direct_hit() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "int main() { return 0; }\n")?;

    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    let object_after_miss = fs::read(fixture.path().join("hello.o"))?;
    assert_eq!(fixture.stat("cache_miss")?, 1);
    assert_eq!(fixture.stat("direct_cache_hit")?, 0);

    fs::remove_file(fixture.path().join("hello.o"))?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    let object_after_hit = fs::read(fixture.path().join("hello.o"))?;

    assert_eq!(object_after_miss, object_after_hit);
    assert_eq!(fixture.stat("cache_miss")?, 1);
    assert_eq!(fixture.stat("direct_cache_hit")?, 1);
    Ok(())
}

#[test]
fn test_ignored_linker_flag_still_hits() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "int main() { return 0; }\n")?;

    // The fake compiler is named gcc, so linker flags are not hashed.
    fixture
        .compile(&["-c", "-Wl,-s", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    fixture
        .compile(&["-c", "-Wl,--gc-sections", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    assert_eq!(fixture.stat("cache_miss")?, 1);
    assert_eq!(fixture.stat("direct_cache_hit")?, 1);
    Ok(())
}

#[test]
fn test_changed_flag_misses() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "int main() { return 0; }\n")?;

    fixture
        .compile(&["-c", "-O2", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    fixture
        .compile(&["-c", "-O3", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    assert_eq!(fixture.stat("cache_miss")?, 2);
    assert_eq!(fixture.stat("direct_cache_hit")?, 0);
    Ok(())
}

#[test]
fn test_changed_source_misses() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "int main() { return 0; }\n")?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    fixture.write("hello.c", "int main() { return 1; }\n")?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    assert_eq!(fixture.stat("cache_miss")?, 2);
    let object = fs::read_to_string(fixture.path().join("hello.o"))?;
    assert!(object.contains("return 1"));
    Ok(())
}

#[test]
fn test_changed_header_rejected_by_manifest() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("foo.h", "#define VALUE 1\n")?;
    fixture.write("hello.c", "#include \"foo.h\"\nint main() { return VALUE; }\n")?;

    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    assert_eq!(fixture.stat("cache_miss")?, 1);

    // Same size, different content.
    fixture.write("foo.h", "#define VALUE 2\n")?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    assert_eq!(fixture.stat("cache_miss")?, 2);
    assert_eq!(fixture.stat("direct_cache_hit")?, 0);

    // The original header content hits its manifest candidate again.
    fixture.write("foo.h", "#define VALUE 1\n")?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    assert_eq!(fixture.stat("direct_cache_hit")?, 1);
    Ok(())
}

#[test]
fn test_time_macro_disables_direct_mode() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "const char *t = __TIME__;\nint main() { return 0; }\n")?;

    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    // Both lookups go through the preprocessor; the manifest is never
    // consulted or written.
    assert_eq!(fixture.stat("cache_miss")?, 1);
    assert_eq!(fixture.stat("direct_cache_hit")?, 0);
    assert_eq!(fixture.stat("preprocessed_cache_hit")?, 1);
    Ok(())
}

#[test]
fn test_incbin_falls_back_to_real_compiler() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write(
        "hello.c",
        "__asm__(\".incbin \\\"blob.bin\\\"\");\nint main() { return 0; }\n",
    )?;

    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    // The object was produced by the fallback compiler run.
    assert!(fixture.path().join("hello.o").exists());
    assert_eq!(fixture.stat("unsupported_code_directive")?, 1);
    assert_eq!(fixture.stat("cache_miss")?, 0);
    Ok(())
}

#[test]
fn test_compile_failure_passes_through_exit_code() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("broken.c", "#error out\n")?;

    fixture
        .compile(&["-c", "broken.c", "-o", "broken.o"])?
        .assert()
        .failure()
        .stderr(predicate::str::contains("error directive"));

    assert_eq!(fixture.stat("preprocessor_error")?, 1);
    Ok(())
}

#[test]
fn test_preprocessing_request_falls_through() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "int main() { return 0; }\n")?;

    fixture
        .compile(&["-E", "hello.c"])?
        .assert()
        .success()
        .stdout(predicate::str::contains("int main()"));
    assert_eq!(fixture.stat("called_for_preprocessing")?, 1);
    Ok(())
}

#[test]
fn test_clear_empties_the_cache() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "int main() { return 0; }\n")?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    fixture.ccache()?.arg("--clear").assert().success();

    // After the wipe the same compilation misses again.
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    assert_eq!(fixture.stat("cache_miss")?, 2);
    Ok(())
}

#[test]
fn test_stats_summary() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "int main() { return 0; }\n")?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    fixture
        .ccache()?
        .arg("-s")
        .assert()
        .success()
        .stdout(predicate::str::contains("cache directory"))
        .stdout(predicate::str::contains("cache miss"));
    Ok(())
}

#[test]
fn test_recompress_keeps_entries_usable() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "int main() { return 0; }\n")?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    fixture
        .ccache()?
        .args(["-X", "uncompressed"])
        .assert()
        .success();
    fixture
        .ccache()?
        .arg("--show-compression")
        .assert()
        .success()
        .stdout(predicate::str::contains("Compressed files"));

    fs::remove_file(fixture.path().join("hello.o"))?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();
    assert_eq!(fixture.stat("direct_cache_hit")?, 1);
    Ok(())
}

#[test]
fn test_dump_manifest() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write("hello.c", "int main() { return 0; }\n")?;
    fixture
        .compile(&["-c", "hello.c", "-o", "hello.o"])?
        .assert()
        .success();

    // Find the stored manifest and dump it.
    let mut manifest = None;
    for entry in walk(&fixture.cache_dir()) {
        if entry.extension().and_then(|e| e.to_str()) == Some("manifest") {
            manifest = Some(entry);
        }
    }
    let manifest = manifest.expect("a manifest was written");
    fixture
        .ccache()?
        .arg("--dump-manifest")
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("Magic: cCmF"));
    Ok(())
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(walk(&path));
            } else {
                files.push(path);
            }
        }
    }
    files
}
