//! Combining the image's base spec with the launch-time override.

use std::collections::HashSet;

use crate::model::{NameValue, Security, Sshd, VmSpec};

/// Merge `over` onto `base`, returning a new spec.
///
/// - A scalar from `over` wins only when it is set.
/// - Setting `command` resets `args` to the override's `args`, even when
///   those are absent.
/// - `env` and `sysctls` merge by name (see [`merge_name_values`]).
/// - `volumes` and `env-from` are replaced wholesale when present in `over`.
/// - Volume mounts without an owner inherit the merged run-as identity.
pub fn merge(base: &VmSpec, over: &VmSpec) -> VmSpec {
    let mut merged = base.clone();

    if let Some(command) = over.command.as_ref().filter(|c| !c.is_empty()) {
        merged.command = Some(command.clone());
        merged.args.clone_from(&over.args);
    } else if over.args.is_some() {
        merged.args.clone_from(&over.args);
    }

    merged.env = merge_name_values(&base.env, &over.env);
    merged.sysctls = merge_name_values(&base.sysctls, &over.sysctls);

    if over.env_from.is_some() {
        merged.env_from.clone_from(&over.env_from);
    }
    if over.volumes.is_some() {
        merged.volumes.clone_from(&over.volumes);
    }

    merged.security = merge_security(&base.security, &over.security);
    merged.working_dir = pick_str(&base.working_dir, &over.working_dir);
    merged.replace_init = pick(&base.replace_init, &over.replace_init);
    merged.shutdown_grace_period = pick(&base.shutdown_grace_period, &over.shutdown_grace_period);

    default_mount_owners(&mut merged);
    merged
}

fn pick<T: Clone>(base: &Option<T>, over: &Option<T>) -> Option<T> {
    over.clone().or_else(|| base.clone())
}

fn pick_str(base: &Option<String>, over: &Option<String>) -> Option<String> {
    let set = |s: &Option<String>| s.clone().filter(|s| !s.is_empty());
    set(over).or_else(|| set(base))
}

fn merge_security(base: &Security, over: &Security) -> Security {
    Security {
        run_as_user_id: pick(&base.run_as_user_id, &over.run_as_user_id),
        run_as_group_id: pick(&base.run_as_group_id, &over.run_as_group_id),
        readonly_root_fs: pick(&base.readonly_root_fs, &over.readonly_root_fs),
        sshd: Sshd {
            enable: pick(&base.sshd.enable, &over.sshd.enable),
        },
    }
}

/// Merge two name/value lists by name.
///
/// The override's entries come first, verbatim and in order (duplicates
/// included), followed by the base entries whose name the override does
/// not mention.
pub(crate) fn merge_name_values(base: &[NameValue], over: &[NameValue]) -> Vec<NameValue> {
    let overridden: HashSet<&str> = over.iter().map(|nv| nv.name.as_str()).collect();
    over.iter()
        .cloned()
        .chain(
            base.iter()
                .filter(|nv| !overridden.contains(nv.name.as_str()))
                .cloned(),
        )
        .collect()
}

fn default_mount_owners(spec: &mut VmSpec) {
    let uid = spec.security.run_as_user_id;
    let gid = spec.security.run_as_group_id;
    for volume in spec.volumes.iter_mut().flatten() {
        for mount in volume.mounts_mut() {
            mount.user_id = mount.user_id.or(uid);
            mount.group_id = mount.group_id.or(gid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EbsVolume, EnvFromDecl, Mount, SsmEnv, SsmVolume, VolumeDecl};

    fn nv(name: &str, value: &str) -> NameValue {
        NameValue::new(name, value)
    }

    #[test]
    fn name_values_merge_in_documented_order() {
        let base = [nv("A", "1"), nv("B", "2")];
        let over = [nv("A", "9"), nv("C", "3")];
        assert_eq!(
            merge_name_values(&base, &over),
            vec![nv("A", "9"), nv("C", "3"), nv("B", "2")]
        );
    }

    #[test]
    fn override_duplicates_pass_through_verbatim() {
        let base = [nv("A", "1")];
        let over = [nv("A", "2"), nv("A", "3")];
        assert_eq!(
            merge_name_values(&base, &over),
            vec![nv("A", "2"), nv("A", "3")]
        );
    }

    #[test]
    fn command_override_resets_args_even_when_absent() {
        let base = VmSpec {
            command: Some(vec!["/base".into()]),
            args: Some(vec!["--base".into()]),
            ..Default::default()
        };
        let over = VmSpec {
            command: Some(vec!["/over".into()]),
            ..Default::default()
        };
        let merged = merge(&base, &over);
        assert_eq!(merged.command, Some(vec!["/over".to_string()]));
        assert_eq!(merged.args, None);

        let over = VmSpec {
            command: Some(vec!["/over".into()]),
            args: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(merge(&base, &over).args, Some(vec![]));
    }

    #[test]
    fn args_alone_keep_base_command() {
        let base = VmSpec {
            command: Some(vec!["/base".into()]),
            args: Some(vec!["--base".into()]),
            ..Default::default()
        };
        let over = VmSpec {
            args: Some(vec!["--over".into()]),
            ..Default::default()
        };
        let merged = merge(&base, &over);
        assert_eq!(merged.argv(), vec!["/base", "--over"]);
    }

    #[test]
    fn unset_scalars_never_override() {
        let base = VmSpec {
            working_dir: Some("/srv".into()),
            replace_init: Some(true),
            shutdown_grace_period: Some(30),
            security: Security {
                run_as_user_id: Some(1000),
                readonly_root_fs: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let over = VmSpec {
            working_dir: Some(String::new()),
            ..Default::default()
        };
        let merged = merge(&base, &over);
        assert_eq!(merged.working_dir.as_deref(), Some("/srv"));
        assert_eq!(merged.replace_init, Some(true));
        assert_eq!(merged.shutdown_grace_period, Some(30));
        assert_eq!(merged.security.run_as_user_id, Some(1000));
        assert!(merged.security.readonly_root_fs());
    }

    #[test]
    fn explicit_scalars_override_including_false_and_zero() {
        let base = VmSpec {
            replace_init: Some(true),
            shutdown_grace_period: Some(30),
            security: Security {
                run_as_user_id: Some(1000),
                ..Default::default()
            },
            ..Default::default()
        };
        let over = VmSpec {
            replace_init: Some(false),
            shutdown_grace_period: Some(0),
            security: Security {
                run_as_user_id: Some(0),
                sshd: Sshd { enable: Some(true) },
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merge(&base, &over);
        assert_eq!(merged.replace_init, Some(false));
        assert_eq!(merged.shutdown_grace_period, Some(0));
        assert_eq!(merged.security.run_as_user_id, Some(0));
        assert!(merged.security.sshd_enabled());
    }

    #[test]
    fn lists_are_replaced_wholesale() {
        let ssm = |path: &str| VolumeDecl {
            ssm: Some(SsmVolume {
                path: path.into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let base = VmSpec {
            volumes: Some(vec![ssm("/a"), ssm("/b")]),
            env_from: Some(vec![EnvFromDecl {
                ssm: Some(SsmEnv {
                    path: "/env".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let over = VmSpec {
            volumes: Some(vec![ssm("/c")]),
            env_from: Some(vec![]),
            ..Default::default()
        };
        let merged = merge(&base, &over);
        assert_eq!(merged.volumes, Some(vec![ssm("/c")]));
        assert_eq!(merged.env_from, Some(vec![]));

        let kept = merge(&base, &VmSpec::default());
        assert_eq!(kept.volumes, base.volumes);
        assert_eq!(kept.env_from, base.env_from);
    }

    #[test]
    fn mount_owner_defaults_to_run_as_identity() {
        let volume = |user_id| VolumeDecl {
            ebs: Some(EbsVolume {
                device: "/dev/sdf".into(),
                fs_type: "ext4".into(),
                mount: Mount {
                    destination: "/data".into(),
                    user_id,
                    ..Default::default()
                },
            }),
            ..Default::default()
        };
        let over = VmSpec {
            volumes: Some(vec![volume(None), volume(Some(7))]),
            security: Security {
                run_as_user_id: Some(1000),
                run_as_group_id: Some(1001),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merge(&VmSpec::default(), &over);
        let mounts: Vec<_> = merged
            .volumes()
            .iter()
            .filter_map(|v| v.ebs.as_ref())
            .map(|e| (e.mount.user_id, e.mount.group_id))
            .collect();
        assert_eq!(mounts, vec![(Some(1000), Some(1001)), (Some(7), Some(1001))]);
    }

    #[test]
    fn merge_is_idempotent_without_collisions() {
        let spec = VmSpec {
            command: Some(vec!["/app".into()]),
            args: Some(vec!["serve".into()]),
            env: vec![nv("A", "1"), nv("B", "2")],
            sysctls: vec![nv("vm.swappiness", "10")],
            working_dir: Some("/srv".into()),
            shutdown_grace_period: Some(5),
            ..Default::default()
        };
        assert_eq!(merge(&spec, &spec), spec);
    }

    #[test]
    fn merge_does_not_mutate_inputs() {
        let base = VmSpec {
            env: vec![nv("A", "1")],
            ..Default::default()
        };
        let over = VmSpec {
            env: vec![nv("A", "2")],
            ..Default::default()
        };
        let snapshot = (base.clone(), over.clone());
        let _ = merge(&base, &over);
        assert_eq!((base, over), snapshot);
    }
}
