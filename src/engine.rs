//! The partition-layout run on a working image.
//!
//! A run attaches the image, finds the squashfs partition, plans the new layout and applies it:
//!
//! 1. grow the backing file and re-attach, if the plan needs more space
//! 2. delete the root partition and recreate it at the same start with the new end
//! 3. zero the slack past the squashfs content
//! 4. create the overlay partition and format it
//!
//! The loop binding is a scoped guard, so it is released on every exit path.  Everything that
//! can be rejected (sizes, label, detection, planning) is checked before the table is touched.

use std::path::Path;

use log::{info, warn};

use crate::{
    error::{Error, IoContext, Result},
    image::{grow_image, zero_range},
    layout::{plan_layout, Disk, LayoutPlan, LayoutRequest},
    loop_device::{partition_path, LoopBinding, LoopControl},
    mkfs::{Formatter, OverlayFs},
    partition::{create_identified, PartitionRecord, PartitionTool, TableScheme},
    squashfs::{FilesystemProbe, FilesystemReport},
    OVERLAY_LABEL,
};

/// The external primitives a run is built from.
#[derive(Clone, Copy)]
pub struct Backends<'a> {
    pub loops: &'a dyn LoopControl,
    pub table: &'a dyn PartitionTool,
    pub probe: &'a dyn FilesystemProbe,
    pub formatter: &'a dyn Formatter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub overlay_fs: OverlayFs,
    pub label: String,
    /// Stop after planning: nothing is grown, mutated or formatted.
    pub dry_run: bool,
    pub progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            overlay_fs: OverlayFs::default(),
            label: OVERLAY_LABEL.into(),
            dry_run: false,
            progress: false,
        }
    }
}

/// What a completed run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub plan: LayoutPlan,
    /// Index of the new overlay partition, `None` for a dry run.
    pub overlay_index: Option<u32>,
}

pub struct Engine<'a> {
    backends: Backends<'a>,
    options: RunOptions,
}

impl<'a> Engine<'a> {
    pub fn new(backends: Backends<'a>, options: RunOptions) -> Self {
        Self { backends, options }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Repartitions the raw disk image at `image` in place.
    pub fn run(&self, image: &Path, request: &LayoutRequest) -> Result<Outcome> {
        let options = &self.options;
        if request.overlay_size == 0 {
            return Err(Error::EmptyOverlay(0));
        }
        options.overlay_fs.check_label(&options.label)?;

        let binding = LoopBinding::attach(self.backends.loops, image)?;
        let (table, root, report) = self.locate(binding.device())?;
        let disk = Disk {
            size: std::fs::metadata(image)
                .io_context(|| format!("reading size of {}", image.display()))?
                .len(),
            scheme: self.backends.table.scheme(binding.device())?,
        };
        let mut plan = plan_layout(&table, &root, &report, request, disk)?;
        info!("layout for {}:\n{plan}", image.display());

        if options.dry_run {
            binding.release()?;
            return Ok(Outcome {
                plan,
                overlay_index: None,
            });
        }

        let binding = match plan.growth {
            0 => binding,
            growth => {
                // the loop device's size is fixed at attach time
                binding.release()?;
                grow_image(image, growth)?;
                let binding = LoopBinding::attach(self.backends.loops, image)?;
                let root = self.relocate(binding.device(), plan.root_start)?;
                plan.rebind(&root);
                binding
            }
        };

        let tool = self.backends.table;
        let device = binding.device();
        tool.delete(device, plan.root_index)?;
        let root_index = create_identified(tool, device, plan.root_start, plan.root_end)?;
        if root_index != plan.root_index {
            warn!(
                "root partition renumbered from {} to {root_index}",
                plan.root_index
            );
            plan.root_index = root_index;
        }
        if plan.scheme == TableScheme::Gpt {
            warn!(
                "root partition {} has a new GPT unique GUID, update any root=PARTUUID= reference",
                plan.root_index
            );
        }

        zero_range(device, plan.tail_zero, options.progress)?;

        let overlay_index = create_identified(tool, device, plan.overlay_start, plan.overlay_end)?;
        self.backends.formatter.format(
            &partition_path(device, overlay_index),
            options.overlay_fs,
            &options.label,
        )?;

        binding.release()?;
        info!(
            "{}: root partition {} resized, overlay partition {overlay_index} created",
            image.display(),
            plan.root_index
        );
        Ok(Outcome {
            plan,
            overlay_index: Some(overlay_index),
        })
    }

    /// Finds the first partition, in index order, that the probe recognises.
    fn locate(
        &self,
        device: &Path,
    ) -> Result<(Vec<PartitionRecord>, PartitionRecord, FilesystemReport)> {
        let table = self.backends.table.list(device)?;

        let mut found = None;
        for record in &table {
            let partition = partition_path(device, record.index);
            if let Some(report) = self.backends.probe.probe(&partition)? {
                info!(
                    "squashfs on partition {} ({} bytes of content)",
                    record.index, report.content_size
                );
                found = Some((*record, report));
                break;
            }
        }

        match found {
            Some((root, report)) => Ok((table, root, report)),
            None => Err(Error::Detection(device.to_path_buf())),
        }
    }

    /// Re-reads the table after a re-attach and finds the root partition by its start offset.
    fn relocate(&self, device: &Path, start: u64) -> Result<PartitionRecord> {
        let lost = || Error::PartitionLost {
            device: device.to_path_buf(),
            start,
        };
        let root = self
            .backends
            .table
            .list(device)?
            .into_iter()
            .find(|r| r.start == start)
            .ok_or_else(lost)?;
        match self.backends.probe.probe(&partition_path(device, root.index))? {
            Some(_) => Ok(root),
            None => Err(lost()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{fs::OpenOptions, os::unix::fs::FileExt};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        error::Category,
        layout::OVERLAY_TAIL_RESERVE,
        size::MIB,
        test::{sparse_image, tempdir, FakeSystem},
    };

    fn record(index: u32, start: u64, end: u64) -> PartitionRecord {
        PartitionRecord { index, start, end }
    }

    fn backends(system: &FakeSystem) -> Backends<'_> {
        Backends {
            loops: system,
            table: system,
            probe: system,
            formatter: system,
        }
    }

    fn request(root: Option<&str>, overlay: &str) -> LayoutRequest {
        LayoutRequest::parse(root, overlay).unwrap()
    }

    /// Scenario A: 100MiB of content in a 110MiB root partition after a small boot partition.
    fn scenario_a() -> FakeSystem {
        FakeSystem::new(
            vec![record(1, 512 * 1024, MIB), record(2, MIB, 111 * MIB)],
            Some((MIB, 100 * MIB)),
        )
    }

    fn probes_until_root() -> Vec<&'static str> {
        vec!["attach", "list", "probe 1", "probe 2"]
    }

    #[test]
    fn test_scenario_growth() {
        let dir = tempdir();
        let image = sparse_image(dir.path(), "a.img", 111 * MIB);
        let file = OpenOptions::new().write(true).open(&image).unwrap();
        // live content and stale slack
        file.write_all_at(&[0xaa; 4096], 50 * MIB).unwrap();
        file.write_all_at(&[0xff; 4096], 104 * MIB).unwrap();

        let system = scenario_a();
        let outcome = Engine::new(backends(&system), RunOptions::default())
            .run(&image, &request(None, "128MiB"))
            .unwrap();

        assert_eq!(outcome.plan.growth, 122 * MIB);
        assert_eq!(outcome.overlay_index, Some(3));
        assert_eq!(*system.attach_count.borrow(), 2);
        assert!(system.attached.borrow().is_none());

        let overlay_end = 233 * MIB - OVERLAY_TAIL_RESERVE;
        let mut expected: Vec<String> = probes_until_root().into_iter().map(String::from).collect();
        expected.extend(
            [
                "scheme".to_string(),
                "detach".into(),
                "attach".into(),
                "list".into(),
                "probe 2".into(),
                "delete 2".into(),
                "list".into(),
                format!("create {}..{}", MIB, 105 * MIB),
                "list".into(),
                "list".into(),
                format!("create {}..{overlay_end}", 105 * MIB),
                "list".into(),
                "format 3 ext4 rootfs_data".into(),
                "detach".into(),
            ]
            .into_iter(),
        );
        assert_eq!(system.calls(), expected);

        let data = std::fs::read(&image).unwrap();
        assert_eq!(data.len() as u64, 233 * MIB);
        let at = |offset: u64| &data[offset as usize..offset as usize + 4096];
        assert!(at(50 * MIB).iter().all(|b| *b == 0xaa));
        assert!(at(104 * MIB).iter().all(|b| *b == 0));
    }

    #[test]
    fn test_gpt_overlay_before_backup_table() {
        let dir = tempdir();
        let image = sparse_image(dir.path(), "gpt.img", 111 * MIB);
        let system = FakeSystem {
            gpt: true,
            ..scenario_a()
        };

        let outcome = Engine::new(backends(&system), RunOptions::default())
            .run(&image, &request(None, "128MiB"))
            .unwrap();

        assert_eq!(outcome.plan.scheme, TableScheme::Gpt);
        let overlay_end = 233 * MIB - TableScheme::Gpt.trailer() - OVERLAY_TAIL_RESERVE;
        assert_eq!(outcome.plan.overlay_end, overlay_end);
        assert!(system
            .calls()
            .contains(&format!("create {}..{overlay_end}", 105 * MIB)));
    }

    #[test]
    fn test_no_growth_never_grows() {
        let dir = tempdir();
        let image = sparse_image(dir.path(), "b.img", 1025 * MIB);
        let system = FakeSystem::new(
            vec![record(1, MIB, 1025 * MIB)],
            Some((MIB, 20 * MIB)),
        );
        let options = RunOptions {
            overlay_fs: OverlayFs::F2fs,
            ..Default::default()
        };

        let outcome = Engine::new(backends(&system), options)
            .run(&image, &request(None, "256MiB"))
            .unwrap();

        assert_eq!(outcome.plan.growth, 0);
        assert_eq!(outcome.overlay_index, Some(2));
        assert_eq!(*system.attach_count.borrow(), 1);
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 1025 * MIB);
        assert_eq!(
            system.calls().last().map(String::as_str),
            Some("detach")
        );
        assert!(system
            .calls()
            .contains(&"format 2 f2fs rootfs_data".to_string()));
    }

    #[test]
    fn test_root_too_small_mutates_nothing() {
        let dir = tempdir();
        let image = sparse_image(dir.path(), "c.img", 200 * MIB);
        let system = FakeSystem::new(
            vec![record(1, MIB, 200 * MIB)],
            Some((MIB, 50 * MIB)),
        );

        let err = Engine::new(backends(&system), RunOptions::default())
            .run(&image, &request(Some("40MiB"), "128MiB"))
            .unwrap_err();

        assert_eq!(err.category(), Category::Constraint);
        assert_eq!(
            system.calls(),
            ["attach", "list", "probe 1", "scheme", "detach"]
        );
        assert!(!system.mutated());
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 200 * MIB);
    }

    #[test]
    fn test_empty_overlay_never_attaches() {
        let system = scenario_a();
        let empty = LayoutRequest {
            root_size: None,
            overlay_size: 0,
        };
        let err = Engine::new(backends(&system), RunOptions::default())
            .run(Path::new("/nonexistent.img"), &empty)
            .unwrap_err();
        assert_eq!(err.category(), Category::Constraint);
        assert!(system.calls().is_empty());
    }

    #[test]
    fn test_bad_label_never_attaches() {
        let system = scenario_a();
        let options = RunOptions {
            label: "a-label-much-too-long-for-ext4".into(),
            ..Default::default()
        };
        let err = Engine::new(backends(&system), options)
            .run(Path::new("/nonexistent.img"), &request(None, "1MiB"))
            .unwrap_err();
        assert_eq!(err.category(), Category::Parse);
        assert!(system.calls().is_empty());
    }

    #[test]
    fn test_detection_failure_detaches() {
        let dir = tempdir();
        let image = sparse_image(dir.path(), "d.img", 111 * MIB);
        let system = FakeSystem::new(
            vec![record(1, 512 * 1024, MIB), record(2, MIB, 111 * MIB)],
            None,
        );

        let err = Engine::new(backends(&system), RunOptions::default())
            .run(&image, &request(None, "128MiB"))
            .unwrap_err();

        assert!(matches!(err, Error::Detection(_)));
        let mut expected = probes_until_root();
        expected.push("detach");
        assert_eq!(system.calls(), expected);
    }

    #[test]
    fn test_tool_failure_detaches() {
        for op in ["delete", "create", "format"] {
            let dir = tempdir();
            let image = sparse_image(dir.path(), "e.img", 111 * MIB);
            let system = FakeSystem {
                fail: Some(op),
                ..scenario_a()
            };

            let err = Engine::new(backends(&system), RunOptions::default())
                .run(&image, &request(None, "128MiB"))
                .unwrap_err();

            assert_eq!(err.category(), Category::ToolFailure, "{op}");
            assert!(system.attached.borrow().is_none(), "{op}");
            assert_eq!(
                system.calls().last().map(String::as_str),
                Some("detach"),
                "{op}"
            );
        }
    }

    #[test]
    fn test_failed_attach_does_not_detach() {
        let system = FakeSystem {
            fail: Some("attach"),
            ..scenario_a()
        };
        let err = Engine::new(backends(&system), RunOptions::default())
            .run(Path::new("/nonexistent.img"), &request(None, "128MiB"))
            .unwrap_err();
        assert_eq!(err.category(), Category::ToolFailure);
        assert_eq!(system.calls(), ["attach"]);
    }

    #[test]
    fn test_no_free_loop_device() {
        /// Hands out `available` loop devices, then runs dry.
        struct Exhausted {
            system: FakeSystem,
            available: u32,
        }
        impl LoopControl for Exhausted {
            fn attach(&self, backing: &Path) -> Result<std::path::PathBuf> {
                if *self.system.attach_count.borrow() == self.available {
                    return Err(Error::NoFreeLoopDevice);
                }
                self.system.attach(backing)
            }
            fn detach(&self, device: &Path) -> Result<()> {
                self.system.detach(device)
            }
        }

        // 0: the first attach fails, 1: the re-attach after growing fails
        for available in [0, 1] {
            let dir = tempdir();
            let image = sparse_image(dir.path(), "h.img", 111 * MIB);
            let loops = Exhausted {
                system: scenario_a(),
                available,
            };
            let backends = Backends {
                loops: &loops,
                ..backends(&loops.system)
            };

            let err = Engine::new(backends, RunOptions::default())
                .run(&image, &request(None, "128MiB"))
                .unwrap_err();

            assert!(matches!(err, Error::NoFreeLoopDevice), "{available}");
            assert_eq!(err.category(), Category::ResourceExhaustion);
            let system = &loops.system;
            assert!(!system.mutated(), "{available}");
            assert!(system.attached.borrow().is_none(), "{available}");
            let calls = system.calls();
            let count = |call: &str| calls.iter().filter(|c| *c == call).count();
            assert_eq!(count("attach"), available as usize);
            assert_eq!(count("detach"), available as usize);
            assert_eq!(count("unbalanced detach"), 0);
        }
    }

    #[test]
    fn test_dry_run() {
        let dir = tempdir();
        let image = sparse_image(dir.path(), "f.img", 111 * MIB);
        let system = scenario_a();
        let options = RunOptions {
            dry_run: true,
            ..Default::default()
        };

        let outcome = Engine::new(backends(&system), options)
            .run(&image, &request(None, "128MiB"))
            .unwrap();

        assert_eq!(outcome.overlay_index, None);
        assert_eq!(outcome.plan.growth, 122 * MIB);
        assert!(!system.mutated());
        let mut expected = probes_until_root();
        expected.extend(["scheme", "detach"]);
        assert_eq!(system.calls(), expected);
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 111 * MIB);
    }

    #[test]
    fn test_root_lost_after_reattach() {
        let dir = tempdir();
        let image = sparse_image(dir.path(), "g.img", 111 * MIB);
        // the root partition is gone from the table once the grown image is re-attached
        struct Vanishing(FakeSystem);
        impl LoopControl for Vanishing {
            fn attach(&self, backing: &Path) -> Result<std::path::PathBuf> {
                if *self.0.attach_count.borrow() == 1 {
                    self.0.records.borrow_mut().retain(|r| r.index != 2);
                }
                self.0.attach(backing)
            }
            fn detach(&self, device: &Path) -> Result<()> {
                self.0.detach(device)
            }
        }
        let system = Vanishing(scenario_a());
        let backends = Backends {
            loops: &system,
            ..backends(&system.0)
        };

        let err = Engine::new(backends, RunOptions::default())
            .run(&image, &request(None, "128MiB"))
            .unwrap_err();

        assert!(matches!(err, Error::PartitionLost { start, .. } if start == MIB));
        assert_eq!(err.category(), Category::Detection);
        assert!(!system.0.mutated());
        assert!(system.0.attached.borrow().is_none());
    }
}
