// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Opens an NVMe controller from user mode, identifies it and optionally
//! exercises a namespace.

use anyhow::Context;
use clap::Parser;
use nvme_driver::Controller;
use nvme_driver::Namespace;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use user_driver::config::HostMemConfig;
use user_driver::heap::DmaHeap;
use user_driver::sysfs::PciBar;

#[derive(Parser)]
#[clap(name = "nvme_probe", about = "Probe an NVMe controller from user mode")]
struct Options {
    /// PCI address of the controller, such as 0000:01:00.0. The function
    /// must be bound to a driver that exposes its BARs, such as
    /// uio_pci_generic, with bus mastering enabled.
    pci_id: String,
    /// DMA heap size in MiB.
    #[clap(long, default_value_t = 128)]
    heap_mb: usize,
    /// I/O queue depth.
    #[clap(long, default_value_t = 32)]
    io_depth: u16,
    /// Namespace for the I/O test.
    #[clap(long, default_value_t = 1)]
    nsid: u32,
    /// Write a test pattern to LBA 0 of the namespace and read it back.
    /// Destroys the data in that block.
    #[clap(long)]
    write_test: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    let filter = if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::default().add_directive(LevelFilter::INFO.into())
    };
    tracing_subscriber::fmt()
        .log_internal_errors(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let config = HostMemConfig::from_env().context("resolving host memory configuration")?;
    let heap = DmaHeap::new(opts.heap_mb << 20, &config).context("allocating DMA heap")?;
    let bar0 = PciBar::open(&opts.pci_id, 0).context("mapping BAR 0")?;

    let mut controller = Controller::open(bar0, &heap).context("opening controller")?;
    let identify = controller.identify();
    println!("serial number:     {}", identify.serial_number());
    println!("model number:      {}", identify.model_number());
    println!("firmware revision: {}", identify.firmware_revision());
    println!("namespaces:        {}", identify.nn);

    let mut qp = controller
        .create_io_qpair(opts.io_depth)
        .context("creating io queue pair")?;
    println!("io queue pair:     qid {} depth {}", qp.qid(), qp.depth());

    if opts.write_test {
        let ns = Namespace::identify(&mut controller, opts.nsid)
            .with_context(|| format!("identifying namespace {}", opts.nsid))?;
        println!(
            "namespace {}:       {} blocks of {} bytes",
            ns.nsid(),
            ns.block_count(),
            ns.block_size()
        );

        let data = (0..82).map(|i| (i % 26) as u8 + b'A').collect::<Vec<_>>();
        let buffer = heap
            .alloc(ns.block_size() as usize)
            .context("allocating io buffer")?;
        buffer.write_at(0, &data);
        ns.write(&mut qp, 0, 1, &buffer).context("writing lba 0")?;
        buffer.zero();
        ns.read(&mut qp, 0, 1, &buffer).context("reading lba 0")?;
        let mut back = vec![0; data.len()];
        buffer.read_at(0, &mut back);
        anyhow::ensure!(back == data, "lba 0 read back differs from what was written");
        println!("write test:        {}", String::from_utf8_lossy(&back));
    }

    controller
        .delete_io_qpair(qp)
        .context("deleting io queue pair")?;
    Ok(())
}
