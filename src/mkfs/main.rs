// Host-side image builder: formats a file as an SFS1 volume with the
// same filesystem code the kernel runs, then copies any listed host
// files into the root directory.
//
//   mkfs fs.img [size-in-mb] [files...]

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use kernel::defs::KResult;
use kernel::fs::{ClockSource, SectorDevice, SimpleFs};

const SECTOR_SIZE: u32 = 512;
const DEFAULT_SIZE_MB: u64 = 4;

struct FileDisk {
    img: File,
    sectors: u32,
}

impl FileDisk {
    fn create<P: AsRef<Path>>(path: P, size_mb: u64) -> std::io::Result<FileDisk> {
        let img = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        img.set_len(size_mb * 1024 * 1024)?;
        Ok(FileDisk {
            img,
            sectors: (size_mb * 1024 * 1024 / SECTOR_SIZE as u64) as u32,
        })
    }
}

impl SectorDevice for FileDisk {
    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn read_sector(&mut self, n: u32, buf: &mut [u8]) -> KResult<()> {
        self.img
            .seek(SeekFrom::Start(n as u64 * SECTOR_SIZE as u64))
            .and_then(|_| self.img.read_exact(buf))
            .map_err(|_| kernel::defs::Err::IoError)
    }

    fn write_sector(&mut self, n: u32, buf: &[u8]) -> KResult<()> {
        self.img
            .seek(SeekFrom::Start(n as u64 * SECTOR_SIZE as u64))
            .and_then(|_| self.img.write_all(buf))
            .map_err(|_| kernel::defs::Err::IoError)
    }
}

struct HostClock;

impl ClockSource for HostClock {
    fn seconds_since_epoch(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

fn die(msg: &str) -> ! {
    eprintln!("mkfs: {}", msg);
    process::exit(1);
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: mkfs fs.img [size-in-mb] [files...]");
        process::exit(1);
    }

    let mut files_from = 2;
    let size_mb = match args.get(2).and_then(|a| a.parse::<u64>().ok()) {
        Some(mb) => {
            files_from = 3;
            mb
        }
        None => DEFAULT_SIZE_MB,
    };

    let disk = match FileDisk::create(&args[1], size_mb) {
        Ok(disk) => disk,
        Err(e) => die(&format!("cannot create {}: {}", args[1], e)),
    };

    let mut fs = SimpleFs::new(Box::new(disk), Box::new(HostClock));
    if let Err(e) = fs.mkfs("HEXOS", 0) {
        die(&format!("mkfs failed: {}", e));
    }
    if let Err(e) = fs.mount(false) {
        die(&format!("mount failed: {}", e));
    }
    println!(
        "mkfs: {} ({} MB, label '{}')",
        args[1],
        size_mb,
        fs.label().unwrap()
    );

    for arg in &args[files_from..] {
        let path = Path::new(arg);
        if !path.exists() {
            die(&format!("no such file: {}", arg));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| die("bad file name"));

        let mut data = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .unwrap_or_else(|e| die(&format!("read {}: {}", arg, e)));

        let target = format!("/{}", name);
        fs.create(&target, false)
            .unwrap_or_else(|e| die(&format!("create {}: {}", target, e)));
        let fd = fs
            .open(&target)
            .unwrap_or_else(|e| die(&format!("open {}: {}", target, e)));
        let written = fs
            .write(fd, &data)
            .unwrap_or_else(|e| die(&format!("write {}: {}", target, e)));
        if written != data.len() {
            die(&format!("short write on {}", target));
        }
        fs.close(fd).unwrap_or_else(|e| die(&format!("close: {}", e)));
        println!("mkfs: added {} ({} bytes)", target, written);
    }

    if let Err(e) = fs.unmount() {
        die(&format!("unmount failed: {}", e));
    }
}
